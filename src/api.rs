use rocket::State;
use rocket::form::Form;
use rocket::fs::{NamedFile, TempFile};
use rocket::http::{CookieJar, Header, Status};
use rocket::response::status::Created;
use rocket::serde::{Deserialize, Serialize, json::Json};
use rocket::{FromForm, Responder};
use tracing::{info, warn};
use validator::Validate;

use crate::auth::session::{current_user_id, end_session, start_session};
use crate::auth::{Permission, Role, User};
use crate::db::{
    add_file, assign_course, assign_student, authenticate_user, create_course, create_user,
    delete_course, delete_file, get_course, get_course_for, get_course_students, get_file_for,
    get_students, get_user, list_courses_for, update_course,
};
use crate::error::AppError;
use crate::models::{Course, CourseDraft, CourseFile, CourseWithFiles};
use crate::storage::{BackupReport, BackupStatus, Database, StorageInfo};
use crate::uploads::UploadStore;
use crate::validation::{ApiError, AppErrorExt, JsonValidateExt, PermissionCheckExt};

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct UserData {
    pub id: i64,
    pub email: String,
    pub role: String,
}

impl From<User> for UserData {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            email: user.email,
            role: user.role.to_string(),
        }
    }
}

#[derive(Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    fn new(message: &str) -> Json<Self> {
        Json(Self {
            message: message.to_string(),
        })
    }
}

#[derive(Deserialize, Validate)]
pub struct LoginRequest {
    #[validate(length(min = 1, message = "Email and password required"))]
    email: String,
    #[validate(length(min = 1, message = "Email and password required"))]
    password: String,
}

#[derive(Deserialize, Validate)]
pub struct SignupRequest {
    #[validate(email(message = "Invalid email format"))]
    email: String,
    #[validate(length(min = 1, message = "Email and password required"))]
    password: String,
}

#[derive(Serialize, Deserialize)]
pub struct LoginResponse {
    pub message: String,
    pub user: UserData,
}

#[derive(Serialize, Deserialize)]
pub struct AuthStatusResponse {
    pub authenticated: bool,
    pub user: Option<UserData>,
}

#[derive(Serialize, Deserialize)]
pub struct MeResponse {
    pub user: UserData,
}

#[post("/login", data = "<login>")]
pub async fn api_login(
    login: Json<LoginRequest>,
    cookies: &CookieJar<'_>,
    db: &State<Database>,
) -> Result<Json<LoginResponse>, ApiError> {
    let validated = login.validate_custom()?;
    info!(email = %validated.email, "Login attempt");

    match authenticate_user(db, &validated.email, &validated.password)
        .await
        .validate_custom()?
    {
        Some(user) => {
            start_session(cookies, &user);
            info!(email = %user.email, role = %user.role, "Login successful");

            Ok(Json(LoginResponse {
                message: "Login successful".to_string(),
                user: UserData::from(user),
            }))
        }
        None => {
            warn!(email = %validated.email, "Login failed: invalid credentials");
            Err(AppError::Authentication("Invalid credentials".to_string())).validate_custom()
        }
    }
}

#[post("/signup", data = "<signup>")]
pub async fn api_signup(
    signup: Json<SignupRequest>,
    cookies: &CookieJar<'_>,
    db: &State<Database>,
) -> Result<Created<Json<LoginResponse>>, ApiError> {
    let validated = signup.validate_custom()?;
    info!(email = %validated.email, "Signup attempt");

    let id = create_user(db, &validated.email, &validated.password, Role::Student)
        .await
        .validate_custom()?;
    let user = get_user(db, id).await.validate_custom()?;

    start_session(cookies, &user);
    info!(email = %user.email, id, "Signup successful");

    Ok(Created::new("/api/me").body(Json(LoginResponse {
        message: "Account created successfully".to_string(),
        user: UserData::from(user),
    })))
}

#[post("/logout")]
pub async fn api_logout(cookies: &CookieJar<'_>) -> Json<MessageResponse> {
    end_session(cookies);
    MessageResponse::new("Logged out successfully")
}

#[get("/check-auth")]
pub async fn api_check_auth(cookies: &CookieJar<'_>, db: &State<Database>) -> Json<AuthStatusResponse> {
    let user = match current_user_id(cookies) {
        Some(id) => match get_user(db, id).await {
            Ok(user) => Some(UserData::from(user)),
            Err(e) => {
                warn!(error = %e, "Clearing session for unknown user");
                end_session(cookies);
                None
            }
        },
        None => None,
    };

    Json(AuthStatusResponse {
        authenticated: user.is_some(),
        user,
    })
}

#[get("/me")]
pub async fn api_me(user: User) -> Json<MeResponse> {
    Json(MeResponse {
        user: UserData::from(user),
    })
}

#[get("/me", rank = 2)]
pub async fn api_me_unauthorized() -> Status {
    Status::Unauthorized
}

#[derive(Serialize, Deserialize)]
pub struct CoursesResponse {
    pub courses: Vec<CourseWithFiles>,
}

#[derive(Serialize, Deserialize)]
pub struct CourseResponse {
    pub course: CourseWithFiles,
}

#[derive(Deserialize)]
pub struct CourseRequest {
    title: Option<String>,
    description: Option<String>,
    content_richtext: Option<String>,
    lyrics: Option<String>,
    audio: Option<String>,
}

impl From<CourseRequest> for CourseDraft {
    fn from(request: CourseRequest) -> Self {
        Self {
            title: request.title,
            description: request.description,
            content_richtext: request.content_richtext,
            lyrics: request.lyrics,
            audio: request.audio,
        }
    }
}

#[derive(Serialize, Deserialize)]
pub struct CourseCreatedResponse {
    pub message: String,
    pub course_id: i64,
}

#[derive(Serialize, Deserialize)]
pub struct CourseUpdatedResponse {
    pub message: String,
    pub course: Course,
}

#[derive(Serialize, Deserialize)]
pub struct CourseDeletedResponse {
    pub message: String,
    pub files_removed: usize,
}

#[get("/courses")]
pub async fn api_get_courses(user: User, db: &State<Database>) -> Result<Json<CoursesResponse>, ApiError> {
    user.require_permission(Permission::ViewAssignedCourses)
        .validate_custom()?;

    let courses = list_courses_for(db, &user).await.validate_custom()?;
    Ok(Json(CoursesResponse { courses }))
}

#[get("/courses/<id>")]
pub async fn api_get_course(
    id: i64,
    user: User,
    db: &State<Database>,
) -> Result<Json<CourseResponse>, ApiError> {
    let course = get_course_for(db, &user, id).await.validate_custom()?;
    Ok(Json(CourseResponse { course }))
}

#[post("/courses", data = "<course>")]
pub async fn api_create_course(
    course: Json<CourseRequest>,
    user: User,
    db: &State<Database>,
) -> Result<Created<Json<CourseCreatedResponse>>, ApiError> {
    user.require_permission(Permission::ManageCourses)
        .validate_custom()?;

    let course_id = create_course(db, course.into_inner().into())
        .await
        .validate_custom()?;

    Ok(
        Created::new(format!("/api/courses/{}", course_id)).body(Json(CourseCreatedResponse {
            message: "Course created".to_string(),
            course_id,
        })),
    )
}

#[put("/courses/<id>", data = "<course>")]
pub async fn api_update_course(
    id: i64,
    course: Json<CourseRequest>,
    user: User,
    db: &State<Database>,
) -> Result<Json<CourseUpdatedResponse>, ApiError> {
    user.require_permission(Permission::ManageCourses)
        .validate_custom()?;

    let course = update_course(db, id, course.into_inner().into())
        .await
        .validate_custom()?;

    Ok(Json(CourseUpdatedResponse {
        message: "Course updated".to_string(),
        course,
    }))
}

#[delete("/courses/<id>")]
pub async fn api_delete_course(
    id: i64,
    user: User,
    db: &State<Database>,
    uploads: &State<UploadStore>,
) -> Result<Json<CourseDeletedResponse>, ApiError> {
    user.require_permission(Permission::ManageCourses)
        .validate_custom()?;

    let files_removed = delete_course(db, uploads, id).await.validate_custom()?;

    Ok(Json(CourseDeletedResponse {
        message: "Course deleted successfully".to_string(),
        files_removed,
    }))
}

#[derive(Serialize, Deserialize)]
pub struct StudentsResponse {
    pub students: Vec<UserData>,
}

#[derive(Deserialize)]
pub struct AssignRequest {
    #[serde(default)]
    student_ids: Vec<i64>,
}

#[derive(Serialize, Deserialize)]
pub struct AssignResponse {
    pub message: String,
    pub assigned: usize,
}

#[derive(Serialize, Deserialize)]
pub struct AssignStudentResponse {
    pub message: String,
    pub created: bool,
}

#[get("/students")]
pub async fn api_get_students(user: User, db: &State<Database>) -> Result<Json<StudentsResponse>, ApiError> {
    user.require_permission(Permission::ViewStudents)
        .validate_custom()?;

    let students = get_students(db).await.validate_custom()?;
    Ok(Json(StudentsResponse {
        students: students.into_iter().map(UserData::from).collect(),
    }))
}

#[get("/courses/<id>/assignments")]
pub async fn api_get_course_assignments(
    id: i64,
    user: User,
    db: &State<Database>,
) -> Result<Json<StudentsResponse>, ApiError> {
    user.require_permission(Permission::ViewStudents)
        .validate_custom()?;

    let students = get_course_students(db, id).await.validate_custom()?;
    Ok(Json(StudentsResponse {
        students: students.into_iter().map(UserData::from).collect(),
    }))
}

#[post("/courses/<id>/assign", data = "<request>")]
pub async fn api_assign_course(
    id: i64,
    request: Json<AssignRequest>,
    user: User,
    db: &State<Database>,
) -> Result<Json<AssignResponse>, ApiError> {
    user.require_permission(Permission::AssignCourses)
        .validate_custom()?;

    let assigned = assign_course(db, id, &request.student_ids)
        .await
        .validate_custom()?;

    let message = if assigned == 0 {
        "All assignments cleared"
    } else {
        "Course assigned successfully"
    };

    Ok(Json(AssignResponse {
        message: message.to_string(),
        assigned,
    }))
}

#[post("/courses/<id>/students/<student_id>")]
pub async fn api_assign_student(
    id: i64,
    student_id: i64,
    user: User,
    db: &State<Database>,
) -> Result<Json<AssignStudentResponse>, ApiError> {
    user.require_permission(Permission::AssignCourses)
        .validate_custom()?;

    get_course(db, id).await.validate_custom()?;
    let student = get_user(db, student_id).await.validate_custom()?;
    if student.role != Role::Student {
        return Err(AppError::Validation("Only students can be assigned".to_string()))
            .validate_custom();
    }

    let created = assign_student(db, id, student_id).await.validate_custom()?;
    let message = if created {
        "Student assigned"
    } else {
        "Student already assigned"
    };

    Ok(Json(AssignStudentResponse {
        message: message.to_string(),
        created,
    }))
}

#[derive(FromForm)]
pub struct UploadForm<'r> {
    file: TempFile<'r>,
}

#[derive(Serialize, Deserialize)]
pub struct FileUploadedResponse {
    pub message: String,
    pub file: CourseFile,
}

#[post("/courses/<id>/upload", data = "<upload>")]
pub async fn api_upload_file(
    id: i64,
    upload: Form<UploadForm<'_>>,
    user: User,
    db: &State<Database>,
    uploads: &State<UploadStore>,
) -> Result<Created<Json<FileUploadedResponse>>, ApiError> {
    user.require_permission(Permission::ManageFiles)
        .validate_custom()?;

    let mut form = upload.into_inner();
    let filename = form
        .file
        .raw_name()
        .map(|name| name.dangerous_unsafe_unsanitized_raw().as_str().to_string())
        .filter(|name| !name.is_empty())
        .ok_or_else(|| AppError::Validation("No file selected".to_string()))
        .validate_custom()?;

    get_course(db, id).await.validate_custom()?;

    let path = uploads.prepare(&filename).await.validate_custom()?;
    form.file
        .copy_to(&path)
        .await
        .map_err(AppError::from)
        .validate_custom()?;

    let stored = path.to_string_lossy().to_string();
    let file = match add_file(db, id, &filename, &stored).await {
        Ok(file) => file,
        Err(e) => {
            uploads.remove(&path).await;
            return Err(e).validate_custom();
        }
    };

    info!(filename = %filename, course_id = id, "File uploaded");
    Ok(
        Created::new(format!("/api/files/{}/download", file.id)).body(Json(FileUploadedResponse {
            message: "File uploaded".to_string(),
            file,
        })),
    )
}

#[delete("/files/<id>")]
pub async fn api_delete_file(
    id: i64,
    user: User,
    db: &State<Database>,
    uploads: &State<UploadStore>,
) -> Result<Json<MessageResponse>, ApiError> {
    user.require_permission(Permission::ManageFiles)
        .validate_custom()?;

    delete_file(db, uploads, id).await.validate_custom()?;
    Ok(MessageResponse::new("File deleted"))
}

#[derive(Responder)]
pub struct Attachment(NamedFile, Header<'static>);

#[get("/files/<id>/download")]
pub async fn api_download_file(
    id: i64,
    user: User,
    db: &State<Database>,
) -> Result<Attachment, ApiError> {
    user.require_permission(Permission::DownloadCourseFiles)
        .validate_custom()?;

    let file = get_file_for(db, &user, id).await.validate_custom()?;
    let named = NamedFile::open(&file.file_path)
        .await
        .map_err(|_| AppError::NotFound("File not found on server".to_string()))
        .validate_custom()?;

    let disposition = format!(
        "attachment; filename=\"{}\"",
        file.filename.replace(['"', '\\'], "_")
    );
    Ok(Attachment(named, Header::new("Content-Disposition", disposition)))
}

#[derive(Serialize, Deserialize)]
pub struct RestoreResponse {
    pub message: String,
    pub restored: usize,
}

#[post("/admin/backup")]
pub async fn api_backup(user: User, db: &State<Database>) -> Result<Json<BackupReport>, ApiError> {
    user.require_permission(Permission::ManageBackups)
        .validate_custom()?;

    Ok(Json(db.backup_now().await))
}

#[post("/admin/restore")]
pub async fn api_restore(user: User, db: &State<Database>) -> Result<Json<RestoreResponse>, ApiError> {
    user.require_permission(Permission::ManageBackups)
        .validate_custom()?;

    let restored = db
        .restore_now()
        .await
        .map_err(AppError::from)
        .validate_custom()?;

    Ok(Json(RestoreResponse {
        message: format!("Restored {} users from backup", restored),
        restored,
    }))
}

#[get("/admin/backup/status")]
pub async fn api_backup_status(user: User, db: &State<Database>) -> Result<Json<BackupStatus>, ApiError> {
    user.require_permission(Permission::ManageBackups)
        .validate_custom()?;

    Ok(Json(db.backup_status().await))
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub storage: StorageInfo,
}

#[get("/health")]
pub fn health(db: &State<Database>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        storage: db.storage_info(),
    })
}
