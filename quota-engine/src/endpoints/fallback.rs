use axum::extract::Request;

use crate::error::{Error, ErrorDetails};

pub async fn handle_404(request: Request) -> Error {
    Error::new(ErrorDetails::RouteNotFound {
        path: request.uri().path().to_string(),
        method: request.method().to_string(),
    })
}
