use labgate_core::domain::experiment::ExperimentName;
use labgate_core::domain::lifecycle::LifecycleState;
use labgate_core::governor::ExperimentSnapshot;

use crate::commands::{
    audit_dispatcher, build_runtime, load_config, load_lifecycle, open_backplane, CommandResult,
    Failure,
};

pub fn run(experiment: &str) -> CommandResult {
    let experiment = ExperimentName::from(experiment);
    let config = match load_config() {
        Ok(config) => config,
        Err(failure) => return CommandResult::from_failure("state", failure),
    };
    let runtime = match build_runtime() {
        Ok(runtime) => runtime,
        Err(failure) => return CommandResult::from_failure("state", failure),
    };

    let result = runtime.block_on(async {
        let backplane = open_backplane(&config).await?;
        let lifecycle =
            load_lifecycle(backplane.clone(), audit_dispatcher(&config), &[experiment.clone()])
                .await?;
        let snapshot = ExperimentSnapshot {
            experiment: experiment.clone(),
            state: lifecycle.get_state(&experiment),
            allowed_transitions: lifecycle.allowed_transitions(&experiment),
            transitions_recorded: lifecycle.get_history(&experiment).len(),
            latest_version: None,
        };
        backplane.pool().close().await;
        Ok::<_, Failure>(snapshot)
    });

    match result {
        Ok(snapshot) => {
            let message = format!(
                "`{}` is {}; allowed next: [{}]",
                snapshot.experiment,
                snapshot.state,
                join_states(&snapshot.allowed_transitions)
            );
            CommandResult::success_with_data("state", message, &snapshot)
        }
        Err(failure) => CommandResult::from_failure("state", failure),
    }
}

fn join_states(states: &[LifecycleState]) -> String {
    states.iter().map(LifecycleState::as_str).collect::<Vec<_>>().join(", ")
}
