//! Confirmation strategies for destructive steps of a run.

use anyhow::Result;

pub trait Confirmation: Send + Sync {
    fn confirm(&self, prompt: &str) -> Result<bool>;
}

/// Asks on the terminal. Defaults to "no".
#[derive(Debug, Clone, Copy, Default)]
pub struct Interactive;

impl Confirmation for Interactive {
    fn confirm(&self, prompt: &str) -> Result<bool> {
        Ok(dialoguer::Confirm::new()
            .with_prompt(prompt)
            .default(false)
            .interact()?)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysYes;

impl Confirmation for AlwaysYes {
    fn confirm(&self, prompt: &str) -> Result<bool> {
        tracing::info!("auto-confirmed: {prompt}");
        Ok(true)
    }
}
