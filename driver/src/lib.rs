//! Per-function compilation pipeline.
//!
//! Synchronous bodies go through folding, dead-code elimination and
//! stackification. Bodies that may suspend are additionally lowered into a
//! state machine before stackification.
use anyhow::Context as _;
use ir_cfg::Function;
use ir_cfg_passes::{
    CfgPass, ConstantFold, EliminateDead, GcDiscover, Stackify, StateMachine, StepLayout,
};
use log::{debug, info};
use middleware::GlobalContext;

pub use session::{CompilerOption, Session};
pub use ty::TypeContext;

/// What the pipeline produced for one function body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompiledFunction {
    /// The body was turned into steps.
    pub lowered: bool,
    /// Steps and suspension points of a lowered body.
    pub layout: Option<StepLayout>,
}

/// Runs every stage over `function` in place.
pub fn compile_function(
    gcx: &GlobalContext<'_>,
    function: &mut Function,
) -> anyhow::Result<CompiledFunction> {
    let name = function.name().to_owned();
    compile(gcx, function).with_context(|| format!("failed to compile function `{name}`"))
}

/// Compiles several bodies with one pass instance each, so step names stay
/// unique across the unit.
pub fn compile_unit(
    gcx: &GlobalContext<'_>,
    functions: &mut [Function],
) -> anyhow::Result<Vec<CompiledFunction>> {
    let mut state_machine = StateMachine::new();
    functions
        .iter_mut()
        .map(|function| {
            let name = function.name().to_owned();
            compile_with(gcx, function, &mut state_machine)
                .with_context(|| format!("failed to compile function `{name}`"))
        })
        .collect()
}

fn compile(gcx: &GlobalContext<'_>, function: &mut Function) -> anyhow::Result<CompiledFunction> {
    compile_with(gcx, function, &mut StateMachine::new())
}

fn compile_with(
    gcx: &GlobalContext<'_>,
    function: &mut Function,
    state_machine: &mut StateMachine,
) -> anyhow::Result<CompiledFunction> {
    let options = gcx.options();
    info!("compiling {}", function.name());
    if options.emit_ir {
        debug!("input:\n{function}");
    }

    run(gcx, function, &mut ConstantFold, "constant folding")?;
    run(gcx, function, &mut EliminateDead, "dead code elimination")?;

    let lowered = function.is_async();
    let layout = if lowered {
        run(gcx, function, state_machine, "state machine lowering")?;
        Some(StepLayout::analyze(function))
    } else {
        None
    };

    if options.stackify {
        run(gcx, function, &mut Stackify, "stackification")?;
    }
    if options.analyze_gc {
        run(gcx, function, &mut GcDiscover, "gc discoverability")?;
    }
    function.verify().context("output graph is malformed")?;

    Ok(CompiledFunction { lowered, layout })
}

fn run<'ctx>(
    gcx: &GlobalContext<'ctx>,
    function: &mut Function,
    pass: &mut impl CfgPass<'ctx>,
    stage: &'static str,
) -> anyhow::Result<()> {
    pass.run_pass(gcx, function)
        .with_context(|| format!("{stage} failed"))?;
    emit(gcx, stage, function);
    Ok(())
}

fn emit(gcx: &GlobalContext<'_>, stage: &str, function: &Function) {
    if gcx.options().emit_ir {
        debug!("after {stage}:\n{function}");
    }
}
