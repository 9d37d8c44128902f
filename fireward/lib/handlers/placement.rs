use std::path::Path;

use crate::{config::MachineSpec, FirewardError, FirewardResult};

use super::{Handler, CREATE_LOG_FILES};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A handler to be inserted immediately before the step named `anchor`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerPlacement {
    handler: Handler,
    anchor: String,
}

/// A base placement plus the requirements chained onto it.
///
/// Resolving the strategy against a base pipeline inserts the placements in reverse
/// declaration order, each immediately before its anchor. With every placement anchored on the
/// same step `B`, the result reads `[Rn, ..., R1, base, B, ...]`.
///
/// ## Examples
///
/// ```
/// use fireward::handlers::{base_pipeline, Handler, HandlerAction, HandlerPlacement, Strategy};
///
/// let strategy = Strategy::new(HandlerPlacement::new(
///     Handler::link_files("vmlinux"),
///     "create_log_files",
/// ))
/// .add_requirement(HandlerPlacement::new(
///     Handler::new("announce", HandlerAction::ValidateConfig),
///     "create_log_files",
/// ));
///
/// let names: Vec<_> = strategy
///     .resolve(base_pipeline())
///     .unwrap()
///     .iter()
///     .map(|h| h.name().to_string())
///     .collect();
///
/// let at = names.iter().position(|n| n == "announce").unwrap();
/// assert_eq!(&names[at..at + 3], ["announce", "link_files", "create_log_files"]);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Strategy {
    base: HandlerPlacement,
    requirements: Vec<HandlerPlacement>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl HandlerPlacement {
    /// Places `handler` immediately before the step named `anchor`.
    pub fn new(handler: Handler, anchor: impl Into<String>) -> Self {
        Self {
            handler,
            anchor: anchor.into(),
        }
    }

    /// Returns the handler.
    pub fn handler(&self) -> &Handler {
        &self.handler
    }

    /// Returns the anchor name.
    pub fn anchor(&self) -> &str {
        &self.anchor
    }
}

impl Strategy {
    /// Creates a strategy from its base placement.
    pub fn new(base: HandlerPlacement) -> Self {
        Self {
            base,
            requirements: Vec::new(),
        }
    }

    /// Returns the default strategy for a machine: link the kernel and drives into the chroot
    /// before the log pipes are created.
    pub fn default_for(machine: &MachineSpec) -> Self {
        let kernel_file_name = Path::new(machine.get_kernel_path())
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        Self::new(HandlerPlacement::new(
            Handler::link_files(kernel_file_name),
            CREATE_LOG_FILES,
        ))
    }

    /// Chains another placement onto the strategy.
    pub fn add_requirement(mut self, placement: HandlerPlacement) -> Self {
        self.requirements.push(placement);
        self
    }

    /// Returns the placements in the order they are applied.
    pub fn placements(&self) -> impl Iterator<Item = &HandlerPlacement> {
        self.requirements
            .iter()
            .rev()
            .chain(std::iter::once(&self.base))
    }

    /// Produces the concrete boot sequence.
    ///
    /// Every anchor must name a step of `base`, otherwise nothing is resolved and the missing
    /// anchor is reported.
    pub fn resolve(&self, base: Vec<Handler>) -> FirewardResult<Vec<Handler>> {
        if let Some(missing) = self
            .placements()
            .find(|p| !base.iter().any(|h| h.name() == p.anchor))
        {
            return Err(FirewardError::AnchorNotFound(missing.anchor.clone()));
        }

        let mut pipeline = base;
        for placement in self.placements() {
            let at = pipeline
                .iter()
                .position(|h| h.name() == placement.anchor)
                .ok_or_else(|| FirewardError::AnchorNotFound(placement.anchor.clone()))?;

            pipeline.insert(at, placement.handler.clone());
        }

        tracing::debug!(
            "resolved boot pipeline: {}",
            pipeline
                .iter()
                .map(Handler::name)
                .collect::<Vec<_>>()
                .join(", ")
        );

        Ok(pipeline)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
