use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
};

/// Why a single work item did not produce a result.
#[derive(Debug, thiserror::Error)]
pub enum TaskError<E> {
    /// The work function returned an error.
    #[error("{0}")]
    Failed(E),
    /// The work function panicked. Contains the panic message, if it had one.
    #[error("work function panicked: {0}")]
    Panicked(String),
}

impl<E> TaskError<E> {
    /// Returns the work function's own error, if that is what this is.
    pub fn as_failed(&self) -> Option<&E> {
        match self {
            TaskError::Failed(e) => Some(e),
            TaskError::Panicked(_) => None,
        }
    }

    /// Returns whether the work function panicked rather than returning an error.
    pub fn is_panic(&self) -> bool {
        matches!(self, TaskError::Panicked(_))
    }
}

/// Runs `f`, turning both its error and any panic into a [`TaskError`].
pub(crate) fn run_guarded<T, E>(f: impl FnOnce() -> Result<T, E>) -> Result<T, TaskError<E>> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(TaskError::Failed(e)),
        Err(payload) => {
            let message = panic_message(&*payload);
            log::warn!("recovered panic in work function: {message}");
            Err(TaskError::Panicked(message))
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}
