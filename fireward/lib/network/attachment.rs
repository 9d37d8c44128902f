use async_trait::async_trait;

use crate::FirewardResult;

use super::{remove_netns, CniAttachmentParams, CniRuntime};

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// The network side of a running instance.
#[async_trait]
pub trait NetworkAttachment: Send + Sync {
    /// Tears the attachment down. Safe to call when it is already gone.
    async fn detach(&self) -> FirewardResult<()>;
}

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// An interface attached through the network plugins, inside a named network namespace.
#[derive(Debug, Clone)]
pub struct CniAttachment {
    runtime: CniRuntime,
    params: CniAttachmentParams,
}

/// An instance without a network.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoNetwork;

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl CniAttachment {
    /// Creates the attachment handle.
    pub fn new(runtime: CniRuntime, params: CniAttachmentParams) -> Self {
        Self { runtime, params }
    }

    /// Returns the attachment parameters.
    pub fn params(&self) -> &CniAttachmentParams {
        &self.params
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl NetworkAttachment for CniAttachment {
    async fn detach(&self) -> FirewardResult<()> {
        tracing::info!(
            "detaching {} from network {}",
            self.params.if_name,
            self.params.network_name
        );

        let result = self.runtime.del(&self.params).await;
        remove_netns(&self.params.netns)?;
        result
    }
}

#[async_trait]
impl NetworkAttachment for NoNetwork {
    async fn detach(&self) -> FirewardResult<()> {
        Ok(())
    }
}
