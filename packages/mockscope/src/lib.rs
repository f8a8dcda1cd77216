//! Scope-bound resource resolution for mocking frameworks.
//!
//! Mocking state (arrangements, recorded calls) must be attached to the
//! test-framework scope that is active when a mocking API is called: the
//! current test method, its fixture, or its assembly. `mockscope` finds that
//! scope from the live call stack and owns the per-scope resource's
//! lifecycle:
//!
//! - [`metadata`] and [`frame`] model the running program and its stack.
//! - [`normalize`] maps async continuation frames back to the declared method.
//! - [`scope`] and [`adapter`] describe scope levels for a host framework.
//! - [`store`] keeps per-level resources, strongly or weakly held.
//! - [`resolver`] orchestrates find / inherit / create / retire.
//! - [`flow`] carries the active test method across `.await` points.

pub mod adapter;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod flow;
pub mod frame;
pub mod ids;
pub mod marker;
pub mod metadata;
pub mod normalize;
pub mod resolver;
pub mod resource;
pub mod scope;
pub mod scope_logging;
pub mod store;

#[doc(hidden)]
pub use log as __log;

pub use adapter::{
    ExceptionFactory, FixtureInstancing, FrameworkAdapter, FrameworkRegistry, LeafKeying,
    MarkerTable, TableAdapter,
};
pub use config::{load_config, MockscopeConfig};
pub use diagnostics::{Diagnostic, DiagnosticKind, Diagnostics};
pub use error::{
    AssertionFailed, BoxError, ConfigError, HostAssertionError, InitializationError, ScopeError,
};
pub use flow::{AsyncContextBridge, FlowSnapshot};
pub use frame::{FrameGuard, RawFrame, ShadowStack, StackSource};
pub use ids::{ClassId, MethodId, ModuleId};
pub use metadata::{CatalogBuilder, MetadataCatalog, MethodKind};
pub use resolver::{CreateMode, Resolver, ResolverBuilder};
pub use resource::{MockRepository, ScopedResource};
pub use scope::{LevelMatch, ScopeKey, ScopeLevel, ScopeRegistry};
pub use store::{ResourceStore, StoreStrategy, StrongStore, WeakStore};
