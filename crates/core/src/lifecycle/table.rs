use std::collections::HashMap;

use thiserror::Error;

use crate::domain::lifecycle::LifecycleState;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransitionTableError {
    #[error("terminal state {0} cannot have outgoing transitions")]
    TerminalStateHasEdges(LifecycleState),
}

/// Static adjacency of legal lifecycle edges.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransitionTable {
    edges: HashMap<LifecycleState, Vec<LifecycleState>>,
}

impl TransitionTable {
    pub fn from_edges<I>(edges: I) -> Result<Self, TransitionTableError>
    where
        I: IntoIterator<Item = (LifecycleState, Vec<LifecycleState>)>,
    {
        let mut table = HashMap::new();
        for (from, targets) in edges {
            if from.is_terminal() && !targets.is_empty() {
                return Err(TransitionTableError::TerminalStateHasEdges(from));
            }
            let entry: &mut Vec<LifecycleState> = table.entry(from).or_default();
            for target in targets {
                if !entry.contains(&target) {
                    entry.push(target);
                }
            }
        }
        Ok(Self { edges: table })
    }

    pub fn allowed(&self, from: LifecycleState) -> &[LifecycleState] {
        self.edges.get(&from).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn permits(&self, from: LifecycleState, to: LifecycleState) -> bool {
        self.allowed(from).contains(&to)
    }
}

impl Default for TransitionTable {
    fn default() -> Self {
        use LifecycleState::{
            Approved, Archived, Draft, Paused, PendingApproval, Ramping, Rejected, RolledBack,
            Running,
        };

        let edges = HashMap::from([
            (Draft, vec![PendingApproval, Archived]),
            (PendingApproval, vec![Approved, Rejected, Draft]),
            (Approved, vec![Running, Ramping, Archived]),
            (Running, vec![Ramping, Paused, RolledBack, Archived]),
            (Ramping, vec![Running, Paused, RolledBack, Archived]),
            (Paused, vec![Running, Ramping, RolledBack, Archived]),
            (RolledBack, vec![Draft, Archived]),
            (Rejected, vec![Draft, Archived]),
            (Archived, Vec::new()),
        ]);
        Self { edges }
    }
}
