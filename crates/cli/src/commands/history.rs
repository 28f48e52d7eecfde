use labgate_core::domain::experiment::ExperimentName;

use crate::commands::{
    audit_dispatcher, build_runtime, load_config, load_lifecycle, open_backplane, CommandResult,
    Failure,
};

pub fn run(experiment: &str) -> CommandResult {
    let experiment = ExperimentName::from(experiment);
    let config = match load_config() {
        Ok(config) => config,
        Err(failure) => return CommandResult::from_failure("history", failure),
    };
    let runtime = match build_runtime() {
        Ok(runtime) => runtime,
        Err(failure) => return CommandResult::from_failure("history", failure),
    };

    let result = runtime.block_on(async {
        let backplane = open_backplane(&config).await?;
        let lifecycle =
            load_lifecycle(backplane.clone(), audit_dispatcher(&config), &[experiment.clone()])
                .await?;
        backplane.pool().close().await;
        Ok::<_, Failure>(lifecycle.get_history(&experiment))
    });

    match result {
        Ok(history) => CommandResult::success_with_data(
            "history",
            format!("`{experiment}` has {} recorded transition(s)", history.len()),
            &history,
        ),
        Err(failure) => CommandResult::from_failure("history", failure),
    }
}
