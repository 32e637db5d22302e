use finsync_core::UserId;

/// Authenticated user for a request.
///
/// Inserted by the auth middleware and required by every sync route; all
/// job and email access is scoped by it.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct UserContext {
    user_id: UserId,
}

impl UserContext {
    pub fn new(user_id: UserId) -> Self {
        Self { user_id }
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }
}
