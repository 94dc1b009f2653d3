// Built-in tasks
//
// Registered in every worker so a fresh deployment can be smoke-tested by
// publishing `debug_task` and reading its result back.

use serde_json::{json, Value};
use taskward_engine::{RegistryError, TaskArgs, TaskContext, TaskError, TaskPolicy, TaskRegistry};
use tracing::info;

/// Name of the request-echo task
pub const DEBUG_TASK: &str = "debug_task";

/// Register the built-in tasks
pub fn register_builtin(registry: &mut TaskRegistry) -> Result<(), RegistryError> {
    registry.register(
        DEBUG_TASK,
        TaskPolicy::default().with_max_retries(0),
        debug_task,
    )
}

/// Log the request this task was invoked with and return it as the result
async fn debug_task(ctx: TaskContext, args: TaskArgs) -> Result<Value, TaskError> {
    let request = json!({
        "id": ctx.task_id,
        "task": ctx.task_name,
        "retries": ctx.retries,
        "slot": ctx.slot,
        "args": args.args,
        "kwargs": args.kwargs,
    });
    info!(request = %request, "debug_task request");
    Ok(request)
}
