//! The capabilities every managed service provides.

use std::sync::Arc;

use anyhow::Result;

use crate::bus::RefreshEvent;
use crate::context::Context;

pub type DynLeader = Arc<dyn ServiceLeader>;
pub type DynAgent = Arc<dyn ServiceAgent>;

/// The cluster-wide half of a service, run only on the elected leader.
#[async_trait::async_trait]
pub trait ServiceLeader: Send + Sync {
    /// The service name, which is also its key segment.
    fn name(&self) -> &'static str;

    /// Keys beneath which any change calls for a refresh.
    fn refresh_keys(&self, _cluster: &str) -> Vec<String> {
        vec![]
    }

    /// Drive the service towards its desired state. Must be idempotent.
    async fn configure(&self, ctx: &Context, event: &RefreshEvent) -> Result<()>;
}

/// The node-local half of a service, run on every node.
#[async_trait::async_trait]
pub trait ServiceAgent: Send + Sync {
    /// The service name, which is also its key segment.
    fn name(&self) -> &'static str;

    /// Called once when the agent starts, before the first reconcile.
    async fn initialize(&self, _ctx: &Context) -> Result<()> {
        Ok(())
    }

    /// Make this node match its desired state. Must be idempotent.
    async fn configure(&self, ctx: &Context) -> Result<()>;

    /// Stop whatever this agent runs on this node. On-disk data is kept.
    async fn destroy(&self, ctx: &Context) -> Result<()>;
}

/// The leaders of every service, in refresh order.
pub fn leaders() -> Vec<DynLeader> {
    vec![
        Arc::new(crate::mon::MonLeader::default()),
        Arc::new(crate::osd::OsdLeader::default()),
        Arc::new(crate::mds::MdsLeader::default()),
        Arc::new(crate::rgw::RgwLeader::default()),
    ]
}

/// The agents of every service.
pub fn agents() -> Vec<DynAgent> {
    vec![
        Arc::new(crate::mon::MonAgent::default()),
        Arc::new(crate::osd::OsdAgent::default()),
        Arc::new(crate::mds::MdsAgent::default()),
        Arc::new(crate::rgw::RgwAgent::default()),
    ]
}
