//! Dotted-path resolution over nested JSON, and the input/output mappings
//! built on top of it.
//!
//! A missing key, an out-of-range index or a scalar in the middle of a path
//! all resolve to `None`. Mapping never fails; absent sources are skipped.

use maestro_core::types::Variables;
use maestro_core::workflow::WorkflowStep;
use serde_json::Value;

use crate::context::ExecutionContext;

/// Root key under which agent output is addressed by output mappings.
pub const OUTPUT_ROOT: &str = "data";

/// Walk `path` (e.g. `a.b.0.c`) starting at `root`.
pub fn resolve<'a>(path: &str, root: &'a Value) -> Option<&'a Value> {
    walk(path.split('.'), root)
}

/// Like [`resolve`], with the first segment looked up in a map.
pub fn resolve_in<'a>(path: &str, root: &'a Variables) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let first = root.get(segments.next()?)?;
    walk(segments, first)
}

fn walk<'a, 'p>(mut segments: impl Iterator<Item = &'p str>, root: &'a Value) -> Option<&'a Value> {
    segments.try_fold(root, |current, key| match current {
        Value::Object(map) => map.get(key),
        Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Build the input handed to a step's agent.
///
/// Without an input mapping the caller's input is passed through verbatim.
pub fn apply_input_mapping(step: &WorkflowStep, ctx: &ExecutionContext) -> Value {
    let Some(mapping) = &step.input_mapping else {
        return Value::Object(ctx.input.clone());
    };

    let mut built = Variables::new();
    for (dest, source) in mapping {
        if let Some(value) = ctx.resolve(source) {
            built.insert(dest.clone(), value);
        }
    }
    Value::Object(built)
}

/// Copy values out of a successful agent response into run variables.
///
/// Sources are addressed as `data.<path>`; `data` alone selects the whole
/// output. Returns the names of the variables that were written.
pub fn apply_output_mapping(
    step: &WorkflowStep,
    output: &Value,
    ctx: &mut ExecutionContext,
) -> Vec<String> {
    let Some(mapping) = &step.output_mapping else {
        return vec![];
    };

    let mut written = Vec::new();
    for (source, dest) in mapping {
        let mut segments = source.split('.');
        if segments.next() != Some(OUTPUT_ROOT) {
            continue;
        }
        if let Some(value) = walk(segments, output) {
            ctx.set_variable(dest.clone(), value.clone());
            written.push(dest.clone());
        }
    }
    written
}
