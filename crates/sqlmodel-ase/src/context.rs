//! Process-wide CT-Library context.
//!
//! CT-Library is initialized once per process (`cs_ctx_alloc` + `ct_init`)
//! and torn down once (`ct_exit` + `cs_ctx_drop`). A failed initialization is
//! final: the library cannot be re-initialized, so every later open reports
//! the original failure.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use sqlmodel_core::error::{ConnectionError, ConnectionErrorKind};
use sqlmodel_core::{Error, Result};

use crate::ffi;
use crate::library::{ClientLibrary, RawContext};
use crate::status::{self, Stage, Verb};

enum ContextState {
    Uninitialized,
    Ready { ctx: RawContext, live: usize },
    /// `ct_exit` succeeded; the context itself is still allocated.
    Exited(RawContext),
    Unusable(String),
    ShutDown,
}

/// Owner of the CT-Library context and the count of connections using it.
pub struct ContextManager {
    library: Option<Arc<dyn ClientLibrary>>,
    version: i32,
    state: Mutex<ContextState>,
}

impl fmt::Debug for ContextManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextManager")
            .field("library", &self.library.as_ref().map(|l| l.name()))
            .field("version", &self.version)
            .field("initialized", &self.is_initialized())
            .field("live_connections", &self.live_connections())
            .finish()
    }
}

impl ContextManager {
    /// A manager over `library`. Nothing is allocated until the first open.
    pub fn new(library: Arc<dyn ClientLibrary>) -> Self {
        Self {
            library: Some(library),
            version: ffi::CS_VERSION_150,
            state: Mutex::new(ContextState::Uninitialized),
        }
    }

    /// A manager that fails every open with `reason`.
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            library: None,
            version: ffi::CS_VERSION_150,
            state: Mutex::new(ContextState::Unusable(reason.into())),
        }
    }

    /// The process-wide manager used by [`AseDriver::new`](crate::AseDriver::new).
    ///
    /// Backed by the linked CT-Library when built with the `ctlib` feature.
    pub fn global() -> Arc<ContextManager> {
        static GLOBAL: OnceLock<Arc<ContextManager>> = OnceLock::new();
        GLOBAL
            .get_or_init(|| {
                #[cfg(feature = "ctlib")]
                let manager = ContextManager::new(Arc::new(crate::native::NativeLibrary::new()));
                #[cfg(not(feature = "ctlib"))]
                let manager = ContextManager::unavailable(
                    "sqlmodel-ase was built without the `ctlib` feature",
                );
                Arc::new(manager)
            })
            .clone()
    }

    /// The CT-Library version requested at initialization.
    pub fn version(&self) -> i32 {
        self.version
    }

    fn state(&self) -> MutexGuard<'_, ContextState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_initialized(&self) -> bool {
        matches!(*self.state(), ContextState::Ready { .. })
    }

    /// Connections currently holding a lease on the context.
    pub fn live_connections(&self) -> usize {
        match *self.state() {
            ContextState::Ready { live, .. } => live,
            _ => 0,
        }
    }

    /// Initialize the library if needed. Idempotent.
    pub fn ensure_initialized(&self) -> Result<()> {
        let mut state = self.state();
        self.initialize(&mut state).map(|_| ())
    }

    fn initialize(&self, state: &mut ContextState) -> Result<RawContext> {
        match state {
            ContextState::Ready { ctx, .. } => return Ok(*ctx),
            ContextState::Unusable(reason) => return Err(not_initialized(reason)),
            ContextState::Exited(_) | ContextState::ShutDown => {
                return Err(not_initialized("the client library was shut down"));
            }
            ContextState::Uninitialized => {}
        }
        let Some(library) = &self.library else {
            return Err(not_initialized("no client library"));
        };

        let ctx = match library.cs_ctx_alloc(self.version) {
            Ok(ctx) => ctx,
            Err(rc) => {
                let err = status::failure(rc, Verb::CtxAlloc, Stage::Init, &[]);
                *state = ContextState::Unusable(err.to_string());
                return Err(err);
            }
        };
        if let Err(err) = status::check(library.ct_init(ctx, self.version), Verb::Init, Stage::Init)
        {
            let rc = library.cs_ctx_drop(ctx);
            if !rc.is_succeed() {
                tracing::warn!(status = %rc, "cs_ctx_drop failed after ct_init failure");
            }
            *state = ContextState::Unusable(err.to_string());
            return Err(err);
        }

        tracing::debug!(
            library = library.name(),
            version = self.version,
            "initialized client library"
        );
        *state = ContextState::Ready { ctx, live: 0 };
        Ok(ctx)
    }

    /// Take a lease for a new connection, initializing on first use.
    pub(crate) fn acquire(&self) -> Result<(Arc<dyn ClientLibrary>, RawContext)> {
        let mut state = self.state();
        let ctx = self.initialize(&mut state)?;
        let library = self
            .library
            .clone()
            .ok_or_else(|| not_initialized("no client library"))?;
        if let ContextState::Ready { live, .. } = &mut *state {
            *live += 1;
        }
        Ok((library, ctx))
    }

    /// Return a lease taken with [`acquire`](Self::acquire).
    pub(crate) fn release(&self) {
        if let ContextState::Ready { live, .. } = &mut *self.state() {
            *live = live.saturating_sub(1);
        }
    }

    /// Tear the library down. Idempotent.
    ///
    /// Fails while connections are open. After a successful shutdown every
    /// open fails with a "driver not initialized" error.
    pub fn shutdown(&self) -> Result<()> {
        let mut state = self.state();
        let ctx = match &*state {
            ContextState::Ready { live, .. } if *live > 0 => {
                return Err(Error::Custom(format!(
                    "cannot shut down the client library: {live} connection(s) still open"
                )));
            }
            ContextState::Ready { ctx, .. } | ContextState::Exited(ctx) => *ctx,
            ContextState::Uninitialized => {
                *state = ContextState::ShutDown;
                return Ok(());
            }
            ContextState::Unusable(_) | ContextState::ShutDown => return Ok(()),
        };
        let Some(library) = &self.library else {
            *state = ContextState::ShutDown;
            return Ok(());
        };

        if matches!(*state, ContextState::Ready { .. }) {
            status::check(library.ct_exit(ctx, false), Verb::Exit, Stage::Close)?;
            *state = ContextState::Exited(ctx);
        }
        status::check(library.cs_ctx_drop(ctx), Verb::CtxDrop, Stage::Close)?;
        *state = ContextState::ShutDown;
        tracing::debug!(library = library.name(), "shut down client library");
        Ok(())
    }
}

fn not_initialized(reason: &str) -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::NotInitialized,
        message: format!("driver not initialized: {reason}"),
        source: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockLibrary;
    use crate::status::RetCode;

    fn manager() -> (Arc<MockLibrary>, ContextManager) {
        let lib = Arc::new(MockLibrary::new());
        let manager = ContextManager::new(lib.clone());
        (lib, manager)
    }

    fn is_not_initialized(err: &Error) -> bool {
        matches!(err, Error::Connection(c) if c.kind == ConnectionErrorKind::NotInitialized)
    }

    #[test]
    fn initializes_once() {
        let (lib, manager) = manager();
        assert!(!manager.is_initialized());
        manager.ensure_initialized().unwrap();
        manager.ensure_initialized().unwrap();
        assert!(manager.is_initialized());
        assert_eq!(lib.call_count(Verb::CtxAlloc), 1);
        assert_eq!(lib.call_count(Verb::Init), 1);
        assert_eq!(lib.live_contexts(), 1);
    }

    #[test]
    fn alloc_failure_is_permanent() {
        let (lib, manager) = manager();
        lib.fail_next(Verb::CtxAlloc);
        let first = manager.ensure_initialized().unwrap_err();
        assert!(is_not_initialized(&first));
        assert!(first.to_string().starts_with("cs_ctx_alloc failed"), "{first}");

        let again = manager.ensure_initialized().unwrap_err();
        assert!(is_not_initialized(&again));
        assert!(again.to_string().starts_with("driver not initialized"), "{again}");
        assert_eq!(lib.call_count(Verb::CtxAlloc), 1);
    }

    #[test]
    fn init_failure_drops_the_context() {
        let (lib, manager) = manager();
        lib.fail_next(Verb::Init);
        let err = manager.ensure_initialized().unwrap_err();
        assert!(err.to_string().starts_with("ct_init failed"), "{err}");
        assert_eq!(lib.live_contexts(), 0);
        assert!(manager.acquire().is_err());
    }

    #[test]
    fn shutdown_waits_for_connections() {
        let (lib, manager) = manager();
        manager.acquire().unwrap();
        assert_eq!(manager.live_connections(), 1);
        assert!(matches!(manager.shutdown(), Err(Error::Custom(_))));
        manager.release();
        manager.shutdown().unwrap();
        manager.shutdown().unwrap();
        assert_eq!(lib.live_contexts(), 0);
        assert_eq!(lib.call_count(Verb::Exit), 1);
        assert!(is_not_initialized(&manager.acquire().map(|_| ()).unwrap_err()));
    }

    #[test]
    fn shutdown_before_use() {
        let (lib, manager) = manager();
        manager.shutdown().unwrap();
        assert!(lib.calls().is_empty());
        assert!(manager.ensure_initialized().is_err());
    }

    #[test]
    fn failed_exit_keeps_the_context() {
        let (lib, manager) = manager();
        manager.ensure_initialized().unwrap();
        lib.fail_next_with(Verb::Exit, RetCode::FAIL);
        assert!(manager.shutdown().is_err());
        assert!(manager.is_initialized());
        manager.shutdown().unwrap();
        assert_eq!(lib.live_contexts(), 0);
    }

    #[test]
    fn failed_drop_retries_only_the_drop() {
        let (lib, manager) = manager();
        manager.ensure_initialized().unwrap();
        lib.fail_next_with(Verb::CtxDrop, RetCode::FAIL);
        assert!(manager.shutdown().is_err());
        assert!(!manager.is_initialized());
        assert!(is_not_initialized(&manager.acquire().map(|_| ()).unwrap_err()));
        assert_eq!(lib.live_contexts(), 1);

        manager.shutdown().unwrap();
        assert_eq!(lib.call_count(Verb::Exit), 1);
        assert_eq!(lib.call_count(Verb::CtxDrop), 2);
        assert_eq!(lib.live_contexts(), 0);
        manager.shutdown().unwrap();
        assert_eq!(lib.call_count(Verb::CtxDrop), 2);
    }

    #[test]
    fn unavailable_manager() {
        let manager = ContextManager::unavailable("no ctlib");
        let err = manager.acquire().map(|_| ()).unwrap_err();
        assert_eq!(err.to_string(), "driver not initialized: no ctlib");
    }

    #[cfg(not(feature = "ctlib"))]
    #[test]
    fn global_without_ctlib_is_unavailable() {
        let err = ContextManager::global().ensure_initialized().unwrap_err();
        assert!(is_not_initialized(&err));
    }
}
