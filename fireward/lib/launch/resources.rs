use std::{fmt, io};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

type Release = Box<dyn FnOnce() -> io::Result<()> + Send + Sync>;

/// Resources scoped to one launch: temporary pipe directories, log sinks, copier tasks.
///
/// Releases run exactly once, in registration order, either through an explicit
/// [`release`](ScopedResources::release) or when the guard is dropped. A failing release is logged
/// and does not stop the ones after it.
#[derive(Default)]
pub struct ScopedResources {
    releases: Vec<(String, Release)>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ScopedResources {
    /// Creates an empty guard.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a release to run when the guard is released.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        release: impl FnOnce() -> io::Result<()> + Send + Sync + 'static,
    ) {
        self.releases.push((name.into(), Box::new(release)));
    }

    /// Moves every release of `other` to the end of this guard.
    pub fn absorb(&mut self, mut other: ScopedResources) {
        self.releases.append(&mut other.releases);
    }

    /// Returns the number of pending releases.
    pub fn len(&self) -> usize {
        self.releases.len()
    }

    /// Returns `true` if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.releases.is_empty()
    }

    /// Runs every pending release in registration order.
    pub fn release(&mut self) {
        for (name, release) in self.releases.drain(..) {
            match release() {
                Ok(()) => tracing::debug!("released {}", name),
                Err(e) => tracing::error!("failed to release {}: {}", name, e),
            }
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Drop for ScopedResources {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for ScopedResources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.releases.iter().map(|(name, _)| name))
            .finish()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
