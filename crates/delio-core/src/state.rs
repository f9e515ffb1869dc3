use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Stage of the cognitive cycle. `Idle` is both the initial state and the
/// only externally observable terminal state.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    Idle,
    Observe,
    Retrieve,
    Plan,
    DeepThink,
    Decide,
    Act,
    Respond,
    Reflect,
    MemoryWrite,
    Notify,
    Error,
}

impl State {
    pub const ALL: [State; 12] = [
        State::Idle,
        State::Observe,
        State::Retrieve,
        State::Plan,
        State::DeepThink,
        State::Decide,
        State::Act,
        State::Respond,
        State::Reflect,
        State::MemoryWrite,
        State::Notify,
        State::Error,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Observe => "OBSERVE",
            Self::Retrieve => "RETRIEVE",
            Self::Plan => "PLAN",
            Self::DeepThink => "DEEP_THINK",
            Self::Decide => "DECIDE",
            Self::Act => "ACT",
            Self::Respond => "RESPOND",
            Self::Reflect => "REFLECT",
            Self::MemoryWrite => "MEMORY_WRITE",
            Self::Notify => "NOTIFY",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for State {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown state: {s}"))
    }
}

/// Side-effecting capability. Only ever used as a key into [`SideEffectMatrix`].
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    ReadFile,
    WriteFile,
    Network,
    SandboxExec,
    MemoryWrite,
    MemoryRead,
    ModelCall,
    SystemNotification,
}

impl Action {
    pub const ALL: [Action; 8] = [
        Action::ReadFile,
        Action::WriteFile,
        Action::Network,
        Action::SandboxExec,
        Action::MemoryWrite,
        Action::MemoryRead,
        Action::ModelCall,
        Action::SystemNotification,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::ReadFile => "READ_FILE",
            Self::WriteFile => "WRITE_FILE",
            Self::Network => "NETWORK",
            Self::SandboxExec => "SANDBOX_EXEC",
            Self::MemoryWrite => "MEMORY_WRITE",
            Self::MemoryRead => "MEMORY_READ",
            Self::ModelCall => "MODEL_CALL",
            Self::SystemNotification => "SYSTEM_NOTIFICATION",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Legal non-emergency transitions. Entering `Error` is always legal and is
/// handled by the guard before this table is consulted, so it never appears
/// as a target here unless a business path names it.
#[derive(Clone, Debug, Default)]
pub struct TransitionTable {
    edges: HashMap<State, HashSet<State>>,
}

impl TransitionTable {
    /// Table with no legal transitions.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn canonical() -> Self {
        use State::*;
        Self::empty()
            .allow_all(Idle, &[Observe, Notify])
            .allow_all(Notify, &[Idle, Error])
            .allow_all(Observe, &[Retrieve, Plan, Error])
            .allow_all(Retrieve, &[Plan, DeepThink, Error])
            .allow_all(DeepThink, &[Decide, Error])
            .allow_all(Plan, &[Decide, Error])
            .allow_all(Decide, &[Act, Respond, Idle, Error])
            .allow_all(Act, &[Reflect, Error])
            .allow_all(Respond, &[Reflect, Error])
            .allow_all(Reflect, &[MemoryWrite, Plan, Error])
            .allow_all(MemoryWrite, &[Idle, Error])
            .allow_all(Error, &[Idle])
    }

    pub fn allow(mut self, from: State, to: State) -> Self {
        self.edges.entry(from).or_default().insert(to);
        self
    }

    pub fn allow_all(mut self, from: State, targets: &[State]) -> Self {
        self.edges.entry(from).or_default().extend(targets.iter().copied());
        self
    }

    /// Whether the table itself lists `from -> to`.
    pub fn permits(&self, from: State, to: State) -> bool {
        self.edges.get(&from).is_some_and(|targets| targets.contains(&to))
    }

    /// Sorted targets reachable from `from`.
    pub fn targets(&self, from: State) -> Vec<State> {
        let mut targets: Vec<State> = self
            .edges
            .get(&from)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        targets.sort();
        targets
    }
}

/// Which states may exercise each [`Action`].
#[derive(Clone, Debug, Default)]
pub struct SideEffectMatrix {
    grants: HashMap<Action, HashSet<State>>,
}

impl SideEffectMatrix {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn canonical() -> Self {
        use State::*;
        Self::empty()
            .grant_all(Action::ReadFile, &[Observe, Act])
            .grant_all(Action::WriteFile, &[Act])
            .grant_all(Action::Network, &[Act, Respond, Notify, Error])
            .grant_all(Action::SandboxExec, &[Act])
            .grant_all(Action::MemoryWrite, &[MemoryWrite])
            .grant_all(Action::MemoryRead, &[Retrieve])
            .grant_all(Action::ModelCall, &[Plan, DeepThink, Reflect])
            .grant_all(Action::SystemNotification, &[Notify])
    }

    pub fn grant(mut self, action: Action, state: State) -> Self {
        self.grants.entry(action).or_default().insert(state);
        self
    }

    pub fn grant_all(mut self, action: Action, states: &[State]) -> Self {
        self.grants.entry(action).or_default().extend(states.iter().copied());
        self
    }

    pub fn permits(&self, action: Action, state: State) -> bool {
        self.grants.get(&action).is_some_and(|states| states.contains(&state))
    }

    pub fn states_for(&self, action: Action) -> Vec<State> {
        let mut states: Vec<State> = self
            .grants
            .get(&action)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        states.sort();
        states
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_names_round_trip() {
        for state in State::ALL {
            assert_eq!(state.name().parse::<State>().unwrap(), state);
        }
        assert_eq!("deep_think".parse::<State>().unwrap(), State::DeepThink);
        assert!("SLEEP".parse::<State>().is_err());
    }

    #[test]
    fn state_serde_uses_screaming_case() {
        let json = serde_json::to_string(&State::MemoryWrite).unwrap();
        assert_eq!(json, "\"MEMORY_WRITE\"");
        let action = serde_json::to_string(&Action::SandboxExec).unwrap();
        assert_eq!(action, "\"SANDBOX_EXEC\"");
    }

    #[test]
    fn canonical_table_edges() {
        let table = TransitionTable::canonical();
        assert_eq!(table.targets(State::Idle), vec![State::Observe, State::Notify]);
        assert_eq!(
            table.targets(State::Decide),
            vec![State::Idle, State::Act, State::Respond, State::Error]
        );
        assert_eq!(table.targets(State::Error), vec![State::Idle]);
        assert!(table.permits(State::Reflect, State::Plan));
        assert!(!table.permits(State::Plan, State::Act));
        assert!(!table.permits(State::Idle, State::Error));
    }

    #[test]
    fn every_state_has_outgoing_edges() {
        let table = TransitionTable::canonical();
        for state in State::ALL {
            assert!(!table.targets(state).is_empty(), "{state} is a dead end");
        }
    }

    #[test]
    fn builder_adds_self_loop() {
        let table = TransitionTable::canonical().allow(State::Plan, State::Plan);
        assert!(table.permits(State::Plan, State::Plan));
        assert!(!TransitionTable::canonical().permits(State::Plan, State::Plan));
    }

    #[test]
    fn canonical_matrix_grants() {
        let matrix = SideEffectMatrix::canonical();
        assert_eq!(
            matrix.states_for(Action::Network),
            vec![State::Act, State::Respond, State::Notify, State::Error]
        );
        assert!(matrix.permits(Action::MemoryRead, State::Retrieve));
        assert!(!matrix.permits(Action::MemoryWrite, State::Retrieve));
        assert!(!matrix.permits(Action::ModelCall, State::Idle));
    }

    #[test]
    fn idle_has_no_side_effects() {
        let matrix = SideEffectMatrix::canonical();
        for action in Action::ALL {
            assert!(!matrix.permits(action, State::Idle), "{action} allowed in IDLE");
        }
    }
}
