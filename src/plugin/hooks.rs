//! Hook orchestration across activated lifecyclers
//!
//! Every phase walks the lifecyclers in activation order, one call at a time.
//! "before" and "with" stop at the first error. "after" keeps going past
//! plugin errors and reports them, because the instance is already live, but
//! still stops on a lost plugin.

use serde::Serialize;

use super::contract::InstanceState;
use super::handle::phase_label;
use super::manager::{ActivatedLifecycler, Progress};
use super::protocol::Operation;
use crate::error::{LifecyclerError, Result};

/// Container settings contributed by plugins, in activation order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StartOptions {
    /// `KEY=VALUE` pairs
    pub environment: Vec<String>,
    pub volumes: Vec<String>,
    pub ports: Vec<String>,
}

/// Outcome of the "after" phase
#[derive(Debug, Default)]
pub struct AfterReport {
    /// Plugins whose AfterInstance ran and succeeded
    pub completed: Vec<String>,

    /// Plugin errors collected along the way
    pub failures: Vec<LifecyclerError>,
}

impl AfterReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Outcome of a full instance operation
#[derive(Debug, Default)]
pub struct OperationReport {
    pub after: AfterReport,
}

impl OperationReport {
    /// Treats collected after-phase failures as an error
    pub fn into_result(self) -> Result<()> {
        if self.after.is_clean() {
            Ok(())
        } else {
            Err(LifecyclerError::AfterPhase(self.after.failures))
        }
    }
}

pub(crate) fn start_options(
    lifecyclers: &mut [ActivatedLifecycler],
    version: &str,
) -> Result<StartOptions> {
    let mut options = StartOptions::default();

    for lifecycler in lifecyclers.iter_mut() {
        let flags = &lifecycler.resolved_flags;
        let handle = &mut lifecycler.handle;

        let environment = handle.environment(version, flags)?;
        let volumes = handle.volumes(version, flags)?;
        let ports = handle.ports(version, flags)?;

        tracing::debug!(
            plugin = %lifecycler.descriptor.name,
            environment = environment.len(),
            volumes = volumes.len(),
            ports = ports.len(),
            "Collected start options"
        );

        options.environment.extend(environment);
        options.volumes.extend(volumes);
        options.ports.extend(ports);
    }

    Ok(options)
}

pub(crate) fn before_instance(
    lifecyclers: &mut [ActivatedLifecycler],
    instance: &InstanceState,
) -> Result<()> {
    for lifecycler in lifecyclers.iter_mut() {
        lifecycler.progress = Progress::Idle;
    }

    for lifecycler in lifecyclers.iter_mut() {
        let state = lifecycler.state_for(instance);
        log_call(lifecycler, Operation::BeforeInstance, instance);
        lifecycler.handle.before_instance(&state)?;
        lifecycler.progress = Progress::Before;
    }

    Ok(())
}

pub(crate) fn with_instance(
    lifecyclers: &mut [ActivatedLifecycler],
    instance: &InstanceState,
) -> Result<()> {
    if !reached(lifecyclers, Progress::Before) {
        return Err(LifecyclerError::InvalidState(
            "WithInstance called before BeforeInstance",
        ));
    }

    for lifecycler in lifecyclers.iter_mut() {
        if lifecycler.progress != Progress::Before {
            tracing::debug!(
                plugin = %lifecycler.descriptor.name,
                "Skipping WithInstance; BeforeInstance did not complete"
            );
            continue;
        }

        let state = lifecycler.state_for(instance);
        log_call(lifecycler, Operation::WithInstance, instance);
        lifecycler.handle.with_instance(&state)?;
        lifecycler.progress = Progress::With;
    }

    Ok(())
}

pub(crate) fn after_instance(
    lifecyclers: &mut [ActivatedLifecycler],
    instance: &InstanceState,
) -> Result<AfterReport> {
    if !reached(lifecyclers, Progress::With) {
        return Err(LifecyclerError::InvalidState(
            "AfterInstance called before WithInstance",
        ));
    }

    let mut report = AfterReport::default();

    for lifecycler in lifecyclers.iter_mut() {
        if lifecycler.progress != Progress::With {
            continue;
        }
        lifecycler.progress = Progress::Idle;

        let state = lifecycler.state_for(instance);
        log_call(lifecycler, Operation::AfterInstance, instance);
        match lifecycler.handle.after_instance(&state) {
            Ok(()) => report.completed.push(lifecycler.descriptor.name.clone()),
            Err(e) if e.is_communication_failure() => {
                for failure in &report.failures {
                    tracing::warn!(
                        error = %failure,
                        "AfterInstance failure superseded by lost plugin"
                    );
                }
                return Err(e);
            }
            Err(e) => {
                tracing::warn!(
                    plugin = %lifecycler.descriptor.name,
                    error = %e,
                    "AfterInstance failed; continuing with remaining plugins"
                );
                report.failures.push(e);
            }
        }
    }

    Ok(report)
}

/// True when the previous phase left at least one lifecycler at `progress`
///
/// With nothing activated every phase is trivially complete.
fn reached(lifecyclers: &[ActivatedLifecycler], progress: Progress) -> bool {
    lifecyclers.is_empty() || lifecyclers.iter().any(|l| l.progress == progress)
}

pub(crate) fn run_instance_operation<F>(
    lifecyclers: &mut [ActivatedLifecycler],
    instance: &InstanceState,
    bring_up: F,
) -> Result<OperationReport>
where
    F: FnOnce(&InstanceState) -> anyhow::Result<()>,
{
    before_instance(lifecyclers, instance)?;
    bring_up(instance).map_err(LifecyclerError::BringUp)?;
    with_instance(lifecyclers, instance)?;
    let after = after_instance(lifecyclers, instance)?;

    tracing::info!(
        instance = %instance.name,
        plugins = lifecyclers.len(),
        after_failures = after.failures.len(),
        "Instance operation complete"
    );

    Ok(OperationReport { after })
}

fn log_call(lifecycler: &ActivatedLifecycler, operation: Operation, instance: &InstanceState) {
    tracing::debug!(
        plugin = %lifecycler.descriptor.name,
        phase = phase_label(operation),
        %operation,
        instance = %instance.name,
        "Invoking hook"
    );
}
