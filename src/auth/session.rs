use rocket::http::{Cookie, CookieJar, SameSite};

use super::User;

const USER_ID: &str = "user_id";
const USER_ROLE: &str = "user_role";

pub fn start_session(cookies: &CookieJar<'_>, user: &User) {
    cookies.add_private(
        Cookie::build((USER_ID, user.id.to_string()))
            .same_site(SameSite::Lax)
            .http_only(true),
    );
    cookies.add_private(
        Cookie::build((USER_ROLE, user.role.to_string()))
            .same_site(SameSite::Lax)
            .http_only(true),
    );
}

pub fn end_session(cookies: &CookieJar<'_>) {
    cookies.remove_private(Cookie::build(USER_ID));
    cookies.remove_private(Cookie::build(USER_ROLE));
}

pub fn current_user_id(cookies: &CookieJar<'_>) -> Option<i64> {
    cookies
        .get_private(USER_ID)
        .and_then(|cookie| cookie.value().parse().ok())
}
