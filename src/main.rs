#[macro_use]
extern crate rocket;

mod api;
mod auth;
mod config;
mod db;
mod env;
mod error;
mod models;
mod storage;
mod telemetry;
#[cfg(test)]
mod test;
mod uploads;
mod validation;

use std::sync::Mutex;

use api::{
    api_assign_course, api_assign_student, api_backup, api_backup_status, api_check_auth,
    api_create_course, api_delete_course, api_delete_file, api_download_file,
    api_get_course, api_get_course_assignments, api_get_courses, api_get_students, api_login,
    api_logout, api_me, api_me_unauthorized, api_restore, api_signup, api_update_course,
    api_upload_file, health,
};
use auth::{forbidden_api, unauthorized_api, unavailable_api};
use db::seed_sample_data;
use rocket::data::{Limits, ToByteUnit};
use rocket::{Build, Rocket};
use storage::Database;
use telemetry::{OtelGuard, TelemetryFairing, init_tracing};
use tracing::{error, info, warn};
use uploads::UploadStore;

pub static TELEMETRY_GUARD: Mutex<Option<OtelGuard>> = Mutex::new(None);

const MAX_UPLOAD_MIB: u64 = 16;

#[launch]
async fn rocket() -> _ {
    if let Err(e) = env::load_environment() {
        eprintln!("Failed to load environment files: {}", e);
    }
    init_tracing();

    let db = Database::from_env();
    let uploads = UploadStore::from_config(&db.config());
    info!(backend = %db.backend(), "Storage backend selected");

    match db.initialize().await {
        Ok(0) => {}
        Ok(restored) => info!(restored, "Restored users from JSON backup"),
        Err(e) => error!(error = %e, "Storage initialisation failed"),
    }

    match seed_sample_data(&db).await {
        Ok(true) => info!("Seeded sample data"),
        Ok(false) => {}
        Err(e) => warn!(error = %e, "Failed to seed sample data"),
    }

    init_rocket(db, uploads).await
}

pub async fn init_rocket(db: Database, uploads: UploadStore) -> Rocket<Build> {
    info!("Starting sloka courses");

    let limits = Limits::default()
        .limit("file", MAX_UPLOAD_MIB.mebibytes())
        .limit("data-form", (MAX_UPLOAD_MIB + 1).mebibytes());

    let figment = rocket::Config::figment().merge(("limits", limits));

    rocket::custom(figment)
        .manage(db)
        .manage(uploads)
        .mount(
            "/api",
            routes![
                api_login,
                api_signup,
                api_logout,
                api_check_auth,
                api_me,
                api_me_unauthorized,
                api_get_courses,
                api_get_course,
                api_create_course,
                api_update_course,
                api_delete_course,
                api_get_students,
                api_get_course_assignments,
                api_assign_course,
                api_assign_student,
                api_upload_file,
                api_delete_file,
                api_download_file,
                api_backup,
                api_restore,
                api_backup_status,
            ],
        )
        .register(
            "/api",
            catchers![unauthorized_api, forbidden_api, unavailable_api],
        )
        .mount("/api", routes![health])
        .attach(TelemetryFairing)
}
