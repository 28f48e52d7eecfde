use crate::commands::{build_runtime, load_config, open_backplane, CommandResult, Failure};

pub fn run() -> CommandResult {
    let config = match load_config() {
        Ok(config) => config,
        Err(failure) => return CommandResult::from_failure("migrate", failure),
    };
    let runtime = match build_runtime() {
        Ok(runtime) => runtime,
        Err(failure) => return CommandResult::from_failure("migrate", failure),
    };

    let result = runtime.block_on(async {
        let backplane = open_backplane(&config).await?;
        backplane.pool().close().await;
        Ok::<(), Failure>(())
    });

    match result {
        Ok(()) => CommandResult::success(
            "migrate",
            format!("applied pending migrations to `{}`", config.database.url),
        ),
        Err(failure) => CommandResult::from_failure("migrate", failure),
    }
}
