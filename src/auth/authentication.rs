use rocket::Request;
use rocket::http::Status;
use rocket::request::{FromRequest, Outcome};
use rocket::response::status::Custom;
use rocket::serde::json::Json;
use serde_json::{Value, json};

use crate::db::get_user;
use crate::error::AppError;
use crate::storage::Database;

use super::{User, session};

#[rocket::async_trait]
impl<'r> FromRequest<'r> for User {
    type Error = ();

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let auth_span = tracing::info_span!("user_auth_guard");
        let _guard = auth_span.enter();

        let Some(user_id) = session::current_user_id(request.cookies()) else {
            return Outcome::Error((Status::Unauthorized, ()));
        };

        let db = match request.rocket().state::<Database>() {
            Some(db) => db,
            _ => {
                tracing::error!("Database not found in managed state");
                return Outcome::Error((Status::InternalServerError, ()));
            }
        };

        match get_user(db, user_id).await {
            Ok(user) => {
                tracing::info!(email = %user.email, role = %user.role.as_str(), "User authenticated via session cookie");
                Outcome::Success(user)
            }
            Err(AppError::NotFound(_)) => {
                tracing::warn!(user_id, "Session refers to unknown user");
                Outcome::Forward(Status::Unauthorized)
            }
            Err(err) => {
                tracing::error!(user_id, error = ?err, "Failed to load user for session");
                Outcome::Error((err.status_code(), ()))
            }
        }
    }
}

#[catch(401)]
pub fn unauthorized_api(_req: &Request) -> Custom<Json<Value>> {
    let error_json = json!({
        "error": "Unauthorized",
        "message": "Authentication required"
    });

    Custom(Status::Unauthorized, Json(error_json))
}

#[catch(403)]
pub fn forbidden_api(_req: &Request) -> Custom<Json<Value>> {
    tracing::warn!("Forbidden access attempt");
    let error_json = json!({
        "error": "Forbidden",
        "message": "You don't have permission to perform this action"
    });

    Custom(Status::Forbidden, Json(error_json))
}

#[catch(503)]
pub fn unavailable_api(_req: &Request) -> Custom<Json<Value>> {
    let error_json = json!({
        "error": "Service Unavailable",
        "message": "Service temporarily unavailable"
    });

    Custom(Status::ServiceUnavailable, Json(error_json))
}
