//! Process-wide default stack.
//!
//! Set-once: an application registers its primary stack at startup and the
//! convenience accessors resolve against it. Replacing a registered stack
//! fails loudly instead of silently swapping storage out from under live
//! contexts.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::StackError;
use crate::stack::DataStack;

static DEFAULT: RwLock<Option<Arc<DataStack>>> = RwLock::new(None);

/// Register the process-wide default stack. Fails with
/// [`StackError::DefaultAlreadySet`] if one is already registered.
pub fn set_default_stack(stack: Arc<DataStack>) -> Result<(), StackError> {
    let mut slot = DEFAULT.write();
    if slot.is_some() {
        return Err(StackError::DefaultAlreadySet);
    }
    *slot = Some(stack);
    Ok(())
}

/// The registered default stack, if any.
pub fn default_stack() -> Option<Arc<DataStack>> {
    DEFAULT.read().clone()
}
