//! Scoped acquisition of external services around one stage call.
//!
//! A stage lists the services it needs as [`ResourceDescriptor`]s. Before
//! the stage function runs, each descriptor's factory produces a
//! [`ServiceHandle`] and its setup callback publishes the handle's address
//! into a [`ServiceContext`]; the context is handed to the stage function
//! explicitly, so nothing about "the current service" lives in globals.
//!
//! ## Teardown order
//!
//! Handles are acquired in declaration order and released in exact reverse
//! order on every exit path: success, stage error, stage panic, and a
//! failure or panic while acquiring or setting up a later resource.
//!
//! ```text
//! acquire R1 → setup R1 → acquire R2 → setup R2 → call
//!                                                   │
//!                         release R1 ← release R2 ←─┘
//! ```

use crate::error::{BoxError, ServiceError};
use crate::service::{ContainerService, ExternalService, ServiceConfig};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, warn};

/// A provisioned service, exclusively owned for one stage invocation.
///
/// Managed handles ([`ContainerService`]) tear the service down on release;
/// no-op handles ([`ExternalService`]) point at an instance someone else
/// manages. Stage code cannot tell the two apart.
#[async_trait]
pub trait ServiceHandle: Send + Sync {
    fn name(&self) -> &str;

    /// Base URL stages use to reach the service, if it speaks HTTP.
    fn base_url(&self) -> Option<String>;

    async fn release(&mut self) -> Result<(), BoxError>;
}

/// Service addresses published for one stage call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceContext {
    addresses: BTreeMap<String, String>,
}

impl ServiceContext {
    pub fn publish(&mut self, service: impl Into<String>, base_url: impl Into<String>) {
        self.addresses.insert(service.into(), base_url.into());
    }

    pub fn address(&self, service: &str) -> Option<&str> {
        self.addresses.get(service).map(String::as_str)
    }

    /// The address of `service`, or an error naming the missing resource.
    pub fn require(&self, service: &str) -> Result<&str, ServiceError> {
        self.address(service).ok_or_else(|| ServiceError::Missing {
            service: service.to_string(),
        })
    }

    pub fn services(&self) -> impl Iterator<Item = (&str, &str)> {
        self.addresses.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

pub type ServiceFactory =
    Arc<dyn Fn() -> BoxFuture<'static, Result<Box<dyn ServiceHandle>, BoxError>> + Send + Sync>;

pub type ServiceSetup =
    Arc<dyn Fn(&dyn ServiceHandle, &mut ServiceContext) -> Result<(), BoxError> + Send + Sync>;

/// How to obtain one service for a stage: a factory and a setup callback.
#[derive(Clone)]
pub struct ResourceDescriptor {
    name: String,
    factory: ServiceFactory,
    setup: ServiceSetup,
}

impl fmt::Debug for ResourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceDescriptor")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl ResourceDescriptor {
    /// A resource produced by `factory`.
    ///
    /// The default setup publishes the handle's base URL under `name`.
    pub fn new<F, Fut, H>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<H, BoxError>> + Send + 'static,
        H: ServiceHandle + 'static,
    {
        let factory: ServiceFactory = Arc::new(move || {
            let pending = factory();
            async move { pending.await.map(|h| Box::new(h) as Box<dyn ServiceHandle>) }.boxed()
        });
        Self::from_parts(name.into(), factory)
    }

    fn from_parts(name: String, factory: ServiceFactory) -> Self {
        let key = name.clone();
        let setup: ServiceSetup = Arc::new(move |handle, ctx| {
            if let Some(url) = handle.base_url() {
                ctx.publish(key.clone(), url);
            }
            Ok(())
        });
        Self {
            name,
            factory,
            setup,
        }
    }

    /// Replace the setup callback run once after each acquisition.
    pub fn with_setup<S>(mut self, setup: S) -> Self
    where
        S: Fn(&dyn ServiceHandle, &mut ServiceContext) -> Result<(), BoxError>
            + Send
            + Sync
            + 'static,
    {
        self.setup = Arc::new(setup);
        self
    }

    /// An externally managed service: nothing is started or stopped.
    pub fn external(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        let name = name.into();
        let service = ExternalService::new(name.clone(), base_url);
        Self::new(name, move || {
            let service = service.clone();
            async move { Ok::<_, BoxError>(service) }
        })
    }

    /// A Docker container started before the stage and removed after it.
    pub fn container(config: ServiceConfig) -> Self {
        let name = config.name.clone();
        let config = Arc::new(config);
        Self::new(name, move || {
            let config = Arc::clone(&config);
            async move { ContainerService::start(&config).await.map_err(BoxError::from) }
        })
    }

    /// Use `external_url` when one is configured, otherwise manage a container.
    pub fn external_or_container(config: ServiceConfig, external_url: Option<String>) -> Self {
        match external_url {
            Some(url) => Self::external(config.name, url),
            None => Self::container(config),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Why a resource scope ended without a value from the wrapped call.
#[derive(Debug)]
pub enum ScopeError<E> {
    /// The factory of `resource` failed or panicked.
    Acquire { resource: String, source: BoxError },
    /// The setup callback of `resource` failed or panicked.
    Setup { resource: String, source: BoxError },
    /// The wrapped call returned an error.
    Call(E),
    /// The wrapped call panicked.
    Panicked(String),
}

/// Acquire `resources` in order, run `call` with the published addresses,
/// then release every acquired handle in reverse order.
///
/// Release failures are logged and never replace the call's outcome.
pub async fn run_with_resources<T, E, F, Fut>(
    resources: &[ResourceDescriptor],
    call: F,
) -> Result<T, ScopeError<E>>
where
    F: FnOnce(ServiceContext) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut ctx = ServiceContext::default();
    let mut held: Vec<(&str, Box<dyn ServiceHandle>)> = Vec::with_capacity(resources.len());
    let mut provision_error = None;

    for resource in resources {
        let acquired = AssertUnwindSafe(async { (resource.factory)().await })
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(panicked(payload.as_ref())));
        let handle = match acquired {
            Ok(handle) => handle,
            Err(source) => {
                provision_error = Some(ScopeError::Acquire {
                    resource: resource.name.clone(),
                    source,
                });
                break;
            }
        };
        debug!(resource = %resource.name, url = ?handle.base_url(), "acquired");
        let setup = panic::catch_unwind(AssertUnwindSafe(|| {
            (resource.setup)(handle.as_ref(), &mut ctx)
        }))
        .unwrap_or_else(|payload| Err(panicked(payload.as_ref())));
        held.push((resource.name.as_str(), handle));
        if let Err(source) = setup {
            provision_error = Some(ScopeError::Setup {
                resource: resource.name.clone(),
                source,
            });
            break;
        }
    }

    let outcome = match provision_error {
        Some(err) => Err(err),
        None => match AssertUnwindSafe(async move { call(ctx).await })
            .catch_unwind()
            .await
        {
            Ok(result) => result.map_err(ScopeError::Call),
            Err(payload) => Err(ScopeError::Panicked(panic_message(payload.as_ref()))),
        },
    };

    release_in_reverse(held).await;
    outcome
}

async fn release_in_reverse(mut held: Vec<(&str, Box<dyn ServiceHandle>)>) {
    while let Some((name, mut handle)) = held.pop() {
        match handle.release().await {
            Ok(()) => debug!(resource = name, "released"),
            Err(e) => warn!(resource = name, error = %e, "release failed"),
        }
    }
}

fn panicked(payload: &(dyn Any + Send)) -> BoxError {
    format!("panicked: {}", panic_message(payload)).into()
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
