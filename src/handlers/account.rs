//! Endpoints about the authenticated caller.

use crate::error::ApiResult;
use crate::models::ProfileResponse;
use crate::pipeline::{HandlerInput, Reply};
use crate::validation::NoInput;

/// `GET /me`: echo the verified identity.
pub async fn me(input: HandlerInput<NoInput, NoInput>) -> ApiResult<Reply> {
    let identity = input.identity()?;
    input.logger.debug("Returning caller profile");

    Reply::data(ProfileResponse {
        user_id: identity.user_id.clone(),
        email: identity.email.clone(),
        role: identity.role.clone(),
    })
}
