use std::sync::{Arc, Mutex};

use tonic::{Code, Status};
use tracing::{debug, warn};

use super::calls::CallTracker;
use crate::completion::notify;
use crate::error::CallError;
use crate::handle::Promise;
use crate::method::{Message, RpcType, decode, encode};
use crate::stream::{slot, take_slot};
use crate::transport::{CallOutcome, ClientCall};

enum UnaryState<T> {
    AwaitingFinish(Promise<T>),
    Done,
}

/// A single terminal result, resolved exactly once.
///
/// Backs unary calls and the final response or status of streaming calls. Whichever completion
/// arrives first (a failed start or the finish) settles it; later ones are ignored.
pub(crate) struct UnaryCall<T> {
    state: Mutex<UnaryState<T>>,
}

impl<T> UnaryCall<T> {
    pub(crate) fn new(promise: Promise<T>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(UnaryState::AwaitingFinish(promise)),
        })
    }

    pub(crate) fn settle(&self, result: Result<T, CallError>) {
        let previous = std::mem::replace(
            &mut *self.state.lock().expect("unary call lock poisoned"),
            UnaryState::Done,
        );
        if let UnaryState::AwaitingFinish(promise) = previous {
            promise.resolve(result);
        }
    }
}

/// Map a finish completion to the call's response.
pub(crate) fn response_from<Resp: Message>(
    ok: bool,
    outcome: Option<CallOutcome>,
    rpc_type: RpcType,
) -> Result<Resp, CallError> {
    let outcome = outcome
        .filter(|_| ok)
        .ok_or(CallError::Invocation { rpc_type })?;
    if outcome.status.code() != Code::Ok {
        return Err(outcome.status.into());
    }

    let payload = outcome
        .response
        .ok_or_else(|| Status::internal("call finished without a response message"))?;
    decode::<Resp>(payload).map_err(|error| {
        warn!(%error, "Failed to decode response");
        Status::internal(format!("failed to decode response: {error}")).into()
    })
}

/// Map a finish completion to the call's final status.
pub(crate) fn status_from(
    ok: bool,
    outcome: Option<CallOutcome>,
    rpc_type: RpcType,
) -> Result<(), CallError> {
    let outcome = outcome
        .filter(|_| ok)
        .ok_or(CallError::Invocation { rpc_type })?;
    match outcome.status.code() {
        Code::Ok => Ok(()),
        _ => Err(outcome.status.into()),
    }
}

/// Issue a unary call: send the request and wait for the single finish completion.
pub(crate) fn start<Req: Message, Resp: Message>(
    method: &'static str,
    call: Arc<dyn ClientCall>,
    request: &Req,
    promise: Promise<Resp>,
    tracker: Arc<CallTracker>,
) {
    let id = tracker.track(method, call.clone());
    let result = UnaryCall::new(promise);

    let on_start = {
        let result = result.clone();
        notify(move |ok| {
            if !ok {
                result.settle(Err(CallError::Invocation {
                    rpc_type: RpcType::Unary,
                }));
            }
        })
    };
    call.start(Some(encode(request)), on_start);

    let outcome = slot();
    let landed = outcome.clone();
    let on_finish = notify(move |ok| {
        tracker.release(&id);
        let response = response_from(ok, take_slot(&landed), RpcType::Unary);
        if let Err(error) = &response {
            debug!(call_id = %id, method, %error, "Unary call failed");
        }
        result.settle(response);
    });
    call.finish(outcome, on_finish);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settle_resolves_once() {
        let (promise, handle) = Promise::channel();
        let call = UnaryCall::new(promise);
        call.settle(Ok(1u32));
        call.settle(Ok(2u32));
        assert_eq!(handle.wait().unwrap(), 1);
    }

    #[test]
    fn test_response_from_failed_completion() {
        let result = response_from::<String>(false, None, RpcType::Unary);
        assert!(matches!(
            result,
            Err(CallError::Invocation {
                rpc_type: RpcType::Unary
            })
        ));
    }

    #[test]
    fn test_response_from_error_status() {
        let outcome = CallOutcome {
            status: Status::not_found("nobody here"),
            response: None,
        };
        let error = response_from::<String>(true, Some(outcome), RpcType::Unary).unwrap_err();
        assert_eq!(error.status().unwrap().code(), Code::NotFound);
    }

    #[test]
    fn test_response_from_missing_message() {
        let outcome = CallOutcome {
            status: Status::ok(""),
            response: None,
        };
        let error = response_from::<String>(true, Some(outcome), RpcType::Unary).unwrap_err();
        assert_eq!(error.status().unwrap().code(), Code::Internal);
    }

    #[test]
    fn test_response_from_decodes() {
        let outcome = CallOutcome {
            status: Status::ok(""),
            response: Some(encode(&"hello".to_string())),
        };
        let response = response_from::<String>(true, Some(outcome), RpcType::Unary).unwrap();
        assert_eq!(response, "hello");
    }

    #[test]
    fn test_status_from() {
        let ok = CallOutcome {
            status: Status::ok(""),
            response: None,
        };
        assert!(status_from(true, Some(ok), RpcType::ServerStreaming).is_ok());

        let cancelled = CallOutcome {
            status: Status::cancelled("gone"),
            response: None,
        };
        let error = status_from(true, Some(cancelled), RpcType::BidiStreaming).unwrap_err();
        assert_eq!(error.status().unwrap().code(), Code::Cancelled);
    }
}
