//! Principal context injection
//!
//! Thread-local storage for the acting user, so every span opened while a
//! request is being served can be attributed without threading the user id
//! through each log call.

use std::cell::RefCell;

use sealbox_core::UserId;
use uuid::Uuid;

/// Principal context data stored in thread-local storage
#[derive(Debug, Clone)]
pub struct PrincipalContextData {
    /// The acting user
    pub user_id: String,
    /// Unique instance ID for this session
    pub instance_id: Uuid,
}

thread_local! {
    static PRINCIPAL_CONTEXT: RefCell<Option<PrincipalContextData>> = const { RefCell::new(None) };
}

/// RAII guard for principal context
///
/// When this guard is created, it sets the principal context for the current
/// thread. When it's dropped, it restores the previous context (if any).
///
/// # Example
///
/// ```ignore
/// use sealbox_logging::context::PrincipalContextGuard;
///
/// let _guard = PrincipalContextGuard::new(alice.user_id());
///
/// // Spans opened in this scope carry user_id = "alice"
/// resources.read_field(&alice, kind, &id, "name").await?;
/// ```
pub struct PrincipalContextGuard {
    previous: Option<PrincipalContextData>,
}

impl PrincipalContextGuard {
    /// Set the acting user for the current scope with a fresh session id
    pub fn new(user_id: &UserId) -> Self {
        Self::with_instance_id(user_id, Uuid::new_v4())
    }

    /// Set the acting user with a specific session id
    ///
    /// Useful when one logical session spans several scopes.
    pub fn with_instance_id(user_id: &UserId, instance_id: Uuid) -> Self {
        let data = PrincipalContextData {
            user_id: user_id.to_string(),
            instance_id,
        };
        let previous = PRINCIPAL_CONTEXT.with(|ctx| ctx.borrow_mut().replace(data));
        Self { previous }
    }

    /// Get the current principal context (if any)
    pub fn current() -> Option<PrincipalContextData> {
        PRINCIPAL_CONTEXT.with(|ctx| ctx.borrow().clone())
    }

    /// Get the current user id (if set)
    pub fn current_user_id() -> Option<String> {
        Self::current().map(|ctx| ctx.user_id)
    }

    /// Get the current session id (if set)
    pub fn current_instance_id() -> Option<Uuid> {
        Self::current().map(|ctx| ctx.instance_id)
    }
}

impl Drop for PrincipalContextGuard {
    fn drop(&mut self) {
        PRINCIPAL_CONTEXT.with(|ctx| *ctx.borrow_mut() = self.previous.take());
    }
}
