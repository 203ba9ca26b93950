use std::cell::RefCell;

use crate::client::{ServiceClient, ServiceRequest, ServiceResponse};
use crate::error::HarnessResult;

/// A client whose responses come from a closure. Every request is recorded.
pub(crate) struct FnClient<F> {
    handler: RefCell<F>,
    calls: RefCell<Vec<ServiceRequest>>,
}

impl<F> FnClient<F>
where
    F: FnMut(&ServiceRequest) -> HarnessResult<ServiceResponse>,
{
    pub(crate) fn new(handler: F) -> Self {
        FnClient {
            handler: RefCell::new(handler),
            calls: RefCell::new(Vec::new()),
        }
    }

    pub(crate) fn calls(&self) -> Vec<ServiceRequest> {
        self.calls.borrow().clone()
    }
}

impl<F> ServiceClient for FnClient<F>
where
    F: FnMut(&ServiceRequest) -> HarnessResult<ServiceResponse>,
{
    fn call(&self, request: &ServiceRequest) -> HarnessResult<ServiceResponse> {
        self.calls.borrow_mut().push(request.clone());
        (self.handler.borrow_mut())(request)
    }
}

pub(crate) fn ok_json(body: serde_json::Value) -> HarnessResult<ServiceResponse> {
    Ok(ServiceResponse::new(200, body.to_string()))
}
