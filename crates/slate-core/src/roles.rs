use serde::{Deserialize, Serialize};

/// The closed set of agent roles a pipeline run executes, in order.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Writer,
    Director,
    Cinematographer,
    Editor,
    Producer,
    Showrunner,
}

/// Fixed execution order for a pipeline run. Roles are never parallelized:
/// each role's budget check depends on the spend left by the previous one.
pub const ROLE_SEQUENCE: [AgentRole; 6] = [
    AgentRole::Writer,
    AgentRole::Director,
    AgentRole::Cinematographer,
    AgentRole::Editor,
    AgentRole::Producer,
    AgentRole::Showrunner,
];

impl AgentRole {
    /// Estimated inference cost for one invocation of this role, in USD.
    /// Used for pre-execution budget authorization; actual cost is recorded
    /// on the proposal the role produces.
    pub fn cost_estimate_usd(&self) -> f64 {
        match self {
            Self::Writer => 0.40,
            Self::Director => 0.30,
            Self::Cinematographer => 0.25,
            Self::Editor => 0.20,
            Self::Producer => 0.15,
            Self::Showrunner => 0.35,
        }
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Writer => write!(f, "writer"),
            Self::Director => write!(f, "director"),
            Self::Cinematographer => write!(f, "cinematographer"),
            Self::Editor => write!(f, "editor"),
            Self::Producer => write!(f, "producer"),
            Self::Showrunner => write!(f, "showrunner"),
        }
    }
}

impl std::str::FromStr for AgentRole {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "writer" => Ok(Self::Writer),
            "director" => Ok(Self::Director),
            "cinematographer" => Ok(Self::Cinematographer),
            "editor" => Ok(Self::Editor),
            "producer" => Ok(Self::Producer),
            "showrunner" => Ok(Self::Showrunner),
            other => Err(format!("unknown agent role: {other}")),
        }
    }
}
