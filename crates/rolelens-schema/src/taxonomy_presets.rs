use serde::Serialize;

/// A built-in categorical dimension.
#[derive(Debug, Clone, Serialize)]
pub struct DimensionPreset {
    pub name: &'static str,
    pub description: &'static str,
    pub categories: &'static [&'static str],
}

/// A built-in role label with the guidance shown to the backend.
#[derive(Debug, Clone, Serialize)]
pub struct RolePreset {
    pub label: &'static str,
    pub description: &'static str,
}

/// A built-in taxonomy version.
#[derive(Debug, Clone, Serialize)]
pub struct TaxonomyPreset {
    pub version: &'static str,
    pub dimensions: &'static [DimensionPreset],
    pub human_roles: &'static [RolePreset],
    pub ai_roles: &'static [RolePreset],
}

pub const SOCIAL_ROLE_THEORY_VERSION: &str = "2.0-social-role-theory";
pub const INTERACTION_ROLES_VERSION: &str = "1.0-interaction-roles";

pub const TAXONOMY_PRESETS: &[TaxonomyPreset] = &[
    TaxonomyPreset {
        version: INTERACTION_ROLES_VERSION,
        dimensions: &[
            DimensionPreset {
                name: "interactionPattern",
                description: "The dominant shape of the exchange",
                categories: &[
                    "question-answer",
                    "storytelling",
                    "advisory",
                    "collaborative",
                    "casual-chat",
                ],
            },
            DimensionPreset {
                name: "emotionalTone",
                description: "The prevailing affect across both speakers",
                categories: &["neutral", "positive", "negative", "mixed"],
            },
            DimensionPreset {
                name: "conversationPurpose",
                description: "What the human appears to want out of the conversation",
                categories: &[
                    "information-seeking",
                    "problem-solving",
                    "entertainment",
                    "self-expression",
                ],
            },
        ],
        human_roles: &[
            RolePreset {
                label: "seeker",
                description: "Asks for information or answers",
            },
            RolePreset {
                label: "learner",
                description: "Wants to understand or acquire a skill",
            },
            RolePreset {
                label: "director",
                description: "Issues instructions for the AI to carry out",
            },
            RolePreset {
                label: "collaborator",
                description: "Works alongside the AI on a shared product",
            },
            RolePreset {
                label: "sharer",
                description: "Shares personal experiences or feelings",
            },
        ],
        ai_roles: &[
            RolePreset {
                label: "expert",
                description: "Supplies authoritative answers",
            },
            RolePreset {
                label: "tutor",
                description: "Teaches and checks understanding",
            },
            RolePreset {
                label: "assistant",
                description: "Executes the human's instructions",
            },
            RolePreset {
                label: "peer",
                description: "Engages as an equal conversational partner",
            },
        ],
    },
    TaxonomyPreset {
        version: SOCIAL_ROLE_THEORY_VERSION,
        dimensions: &[
            DimensionPreset {
                name: "interactionPattern",
                description: "The dominant shape of the exchange",
                categories: &[
                    "question-answer",
                    "storytelling",
                    "advisory",
                    "collaborative",
                    "casual-chat",
                    "philosophical-dialogue",
                    "debate",
                ],
            },
            DimensionPreset {
                name: "powerDynamics",
                description: "Who steers the conversation",
                categories: &["human-led", "ai-led", "balanced", "shifting"],
            },
            DimensionPreset {
                name: "emotionalTone",
                description: "The prevailing affect across both speakers",
                categories: &[
                    "neutral",
                    "supportive",
                    "playful",
                    "serious",
                    "empathetic",
                    "professional",
                    "frustrated",
                ],
            },
            DimensionPreset {
                name: "engagementStyle",
                description: "How the human engages with the AI's contributions",
                categories: &[
                    "questioning",
                    "directive",
                    "exploratory",
                    "reactive",
                    "reflective",
                ],
            },
            DimensionPreset {
                name: "knowledgeExchange",
                description: "The kind of content that moves between the speakers",
                categories: &[
                    "factual-info",
                    "skill-sharing",
                    "opinion-exchange",
                    "personal-sharing",
                    "meta-discussion",
                ],
            },
            DimensionPreset {
                name: "conversationPurpose",
                description: "What the human appears to want out of the conversation",
                categories: &[
                    "information-seeking",
                    "problem-solving",
                    "entertainment",
                    "relationship-building",
                    "self-expression",
                    "learning",
                ],
            },
            DimensionPreset {
                name: "topicDepth",
                description: "How far the conversation goes beyond surface-level treatment",
                categories: &["surface", "moderate", "deep"],
            },
            DimensionPreset {
                name: "turnTaking",
                description: "Which side contributes most of the conversational volume",
                categories: &["user-dominant", "assistant-dominant", "balanced"],
            },
        ],
        human_roles: &[
            RolePreset {
                label: "information-seeker",
                description: "Requests facts, explanations or answers",
            },
            RolePreset {
                label: "provider",
                description: "Supplies information, material or context for the AI to work on",
            },
            RolePreset {
                label: "director",
                description: "Gives instructions and expects them to be executed",
            },
            RolePreset {
                label: "co-constructor",
                description: "Builds ideas or artifacts jointly with the AI",
            },
            RolePreset {
                label: "social-expressor",
                description: "Shares feelings, experiences or opinions for their own sake",
            },
            RolePreset {
                label: "relational-peer",
                description: "Treats the AI as a companion or friend",
            },
        ],
        ai_roles: &[
            RolePreset {
                label: "expert-system",
                description: "Delivers authoritative information and answers",
            },
            RolePreset {
                label: "facilitator",
                description: "Guides the human's own thinking or learning",
            },
            RolePreset {
                label: "advisor",
                description: "Offers recommendations tailored to the human's situation",
            },
            RolePreset {
                label: "co-constructor",
                description: "Contributes as a creative or analytical partner",
            },
            RolePreset {
                label: "social-facilitator",
                description: "Keeps a social exchange going and mirrors affect",
            },
            RolePreset {
                label: "relational-peer",
                description: "Responds as a companion rather than a tool",
            },
        ],
    },
];

pub fn find_preset(version: &str) -> Option<&'static TaxonomyPreset> {
    TAXONOMY_PRESETS.iter().find(|p| p.version == version)
}
