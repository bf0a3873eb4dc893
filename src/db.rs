use std::collections::{HashMap, HashSet};

use tracing::{info, instrument, warn};

use crate::auth::{DbUser, Permission, Role, User};
use crate::error::AppError;
use crate::models::{Course, CourseDraft, CourseFile, CourseWithFiles};
use crate::params;
use crate::storage::{Database, Row, Statement, Table};
use crate::uploads::UploadStore;

#[cfg(not(test))]
const HASH_COST: u32 = bcrypt::DEFAULT_COST;
#[cfg(test)]
const HASH_COST: u32 = 4;

const USER_COLUMNS: &str = "id, email, role, created_at";
const COURSE_COLUMNS: &str = "id, title, description, content_richtext, lyrics, audio, created_at";
const FILE_COLUMNS: &str = "id, course_id, filename, file_path, uploaded_at";

fn decode_user(row: Row) -> Result<User, AppError> {
    User::try_from(row.decode::<DbUser>()?)
}

fn decode_all<T: serde::de::DeserializeOwned>(rows: Vec<Row>) -> Result<Vec<T>, AppError> {
    rows.into_iter()
        .map(|row| row.decode().map_err(AppError::from))
        .collect()
}

#[instrument(skip(db))]
pub async fn get_user(db: &Database, id: i64) -> Result<User, AppError> {
    info!("Fetching user by ID");
    let row = db
        .fetch_one(
            &format!("SELECT {} FROM users WHERE id = ?", USER_COLUMNS),
            params![id],
        )
        .await?;

    match row {
        Some(row) => decode_user(row),
        _ => Err(AppError::NotFound(format!(
            "User with id {} not found in database",
            id
        ))),
    }
}

#[instrument(skip(db))]
pub async fn find_user_by_email(db: &Database, email: &str) -> Result<Option<DbUser>, AppError> {
    info!("Finding user by email");
    let row = db
        .fetch_one(
            "SELECT id, email, hashed_password, role, created_at FROM users WHERE email = ?",
            params![email],
        )
        .await?;

    row.map(|row| row.decode::<DbUser>().map_err(AppError::from))
        .transpose()
}

#[instrument(skip(db, password))]
pub async fn authenticate_user(
    db: &Database,
    email: &str,
    password: &str,
) -> Result<Option<User>, AppError> {
    info!("Authenticating user");
    let Some(user) = find_user_by_email(db, email).await? else {
        return Ok(None);
    };

    let Some(hash) = user.hashed_password.as_deref() else {
        return Ok(None);
    };

    match bcrypt::verify(password, hash) {
        Ok(true) => Ok(Some(User::try_from(user)?)),
        Ok(false) => Ok(None),
        Err(e) => {
            warn!(error = %e, "Stored password hash could not be verified");
            Ok(None)
        }
    }
}

#[instrument(skip(db, password))]
pub async fn create_user(
    db: &Database,
    email: &str,
    password: &str,
    role: Role,
) -> Result<i64, AppError> {
    info!("Creating new user");
    if find_user_by_email(db, email).await?.is_some() {
        return Err(AppError::Conflict("Email already registered".to_string()));
    }

    let hashed_password = bcrypt::hash(password, HASH_COST)?;

    let id = db
        .insert(
            Table::Users,
            vec![
                ("email", email.into()),
                ("hashed_password", hashed_password.into()),
                ("role", role.as_str().into()),
            ],
        )
        .await?;

    Ok(id)
}

#[instrument(skip(db))]
pub async fn get_students(db: &Database) -> Result<Vec<User>, AppError> {
    info!("Getting all students");
    let rows = db
        .fetch_all(
            &format!(
                "SELECT {} FROM users WHERE role = 'student' ORDER BY email",
                USER_COLUMNS
            ),
            params![],
        )
        .await?;

    rows.into_iter().map(decode_user).collect()
}

#[instrument(skip(db))]
pub async fn get_course_students(db: &Database, course_id: i64) -> Result<Vec<User>, AppError> {
    info!("Getting students assigned to course");
    let rows = db
        .fetch_all(
            "SELECT u.id, u.email, u.role, u.created_at
             FROM users u
             JOIN assigned_courses ac ON u.id = ac.user_id
             WHERE ac.course_id = ?
             ORDER BY u.email",
            params![course_id],
        )
        .await?;

    rows.into_iter().map(decode_user).collect()
}

#[instrument(skip(db))]
pub async fn get_course(db: &Database, id: i64) -> Result<Course, AppError> {
    let row = db
        .fetch_one(
            &format!("SELECT {} FROM courses WHERE id = ?", COURSE_COLUMNS),
            params![id],
        )
        .await?;

    match row {
        Some(row) => Ok(row.decode()?),
        _ => Err(AppError::NotFound("Course not found".to_string())),
    }
}

#[instrument(skip(db))]
pub async fn get_course_files(db: &Database, course_id: i64) -> Result<Vec<CourseFile>, AppError> {
    let rows = db
        .fetch_all(
            &format!(
                "SELECT {} FROM files WHERE course_id = ? ORDER BY id",
                FILE_COLUMNS
            ),
            params![course_id],
        )
        .await?;

    decode_all(rows)
}

fn attach_files(courses: Vec<Course>, files: Vec<CourseFile>) -> Vec<CourseWithFiles> {
    let mut by_course: HashMap<i64, Vec<CourseFile>> = HashMap::new();
    for file in files {
        by_course.entry(file.course_id).or_default().push(file);
    }

    courses
        .into_iter()
        .map(|course| CourseWithFiles {
            files: by_course.remove(&course.id).unwrap_or_default(),
            course,
        })
        .collect()
}

/// All courses for an admin, only assigned ones for a student. Newest first.
#[instrument(skip(db, user), fields(user_id = user.id, role = %user.role))]
pub async fn list_courses_for(db: &Database, user: &User) -> Result<Vec<CourseWithFiles>, AppError> {
    info!("Listing courses");
    let (course_rows, file_rows) = if user.has_permission(Permission::ViewAllCourses) {
        let courses = db
            .fetch_all(
                &format!(
                    "SELECT {} FROM courses ORDER BY created_at DESC, id DESC",
                    COURSE_COLUMNS
                ),
                params![],
            )
            .await?;
        let files = db
            .fetch_all(
                &format!("SELECT {} FROM files ORDER BY id", FILE_COLUMNS),
                params![],
            )
            .await?;
        (courses, files)
    } else {
        let courses = db
            .fetch_all(
                "SELECT c.id, c.title, c.description, c.content_richtext, c.lyrics, c.audio, c.created_at
                 FROM courses c
                 JOIN assigned_courses ac ON c.id = ac.course_id
                 WHERE ac.user_id = ?
                 ORDER BY c.created_at DESC, c.id DESC",
                params![user.id],
            )
            .await?;
        let files = db
            .fetch_all(
                "SELECT f.id, f.course_id, f.filename, f.file_path, f.uploaded_at
                 FROM files f
                 JOIN assigned_courses ac ON f.course_id = ac.course_id
                 WHERE ac.user_id = ?
                 ORDER BY f.id",
                params![user.id],
            )
            .await?;
        (courses, files)
    };

    Ok(attach_files(decode_all(course_rows)?, decode_all(file_rows)?))
}

#[instrument(skip(db))]
pub async fn is_assigned(db: &Database, user_id: i64, course_id: i64) -> Result<bool, AppError> {
    let row = db
        .fetch_one(
            "SELECT COUNT(*) AS count FROM assigned_courses WHERE user_id = ? AND course_id = ?",
            params![user_id, course_id],
        )
        .await?;

    Ok(row.and_then(|row| row.get_i64("count")).unwrap_or(0) > 0)
}

async fn require_course_access(db: &Database, user: &User, course_id: i64) -> Result<(), AppError> {
    if user.has_permission(Permission::ViewAllCourses)
        || is_assigned(db, user.id, course_id).await?
    {
        Ok(())
    } else {
        Err(AppError::Authorization("Access denied".to_string()))
    }
}

#[instrument(skip(db, user), fields(user_id = user.id))]
pub async fn get_course_for(
    db: &Database,
    user: &User,
    course_id: i64,
) -> Result<CourseWithFiles, AppError> {
    require_course_access(db, user, course_id).await?;

    let course = get_course(db, course_id).await?;
    let files = get_course_files(db, course_id).await?;

    Ok(CourseWithFiles { course, files })
}

#[instrument(skip(db, draft))]
pub async fn create_course(db: &Database, draft: CourseDraft) -> Result<i64, AppError> {
    let title = draft
        .title
        .filter(|title| !title.trim().is_empty())
        .ok_or_else(|| AppError::Validation("Title is required".to_string()))?;

    info!(title = %title, "Creating new course");
    let id = db
        .insert(
            Table::Courses,
            vec![
                ("title", title.into()),
                ("description", draft.description.unwrap_or_default().into()),
                (
                    "content_richtext",
                    draft.content_richtext.unwrap_or_default().into(),
                ),
                ("lyrics", draft.lyrics.into()),
                ("audio", draft.audio.into()),
            ],
        )
        .await?;

    Ok(id)
}

/// Applies `draft` to course `id`. Fields the draft leaves out keep their
/// current values.
#[instrument(skip(db, draft))]
pub async fn update_course(db: &Database, id: i64, draft: CourseDraft) -> Result<Course, AppError> {
    let current = get_course(db, id).await?;
    let course = draft.merge_into(current);

    if course.title.trim().is_empty() {
        return Err(AppError::Validation("Title is required".to_string()));
    }

    info!(title = %course.title, "Updating course");
    db.execute(
        "UPDATE courses
         SET title = ?, description = ?, content_richtext = ?, lyrics = ?, audio = ?
         WHERE id = ?",
        params![
            &course.title,
            course.description.clone(),
            course.content_richtext.clone(),
            course.lyrics.clone(),
            course.audio.clone(),
            id
        ],
    )
    .await?;

    Ok(course)
}

/// Deletes a course with its files and assignments, then removes the stored
/// bytes of its files. Returns how many stored files were removed.
#[instrument(skip(db, uploads))]
pub async fn delete_course(db: &Database, uploads: &UploadStore, id: i64) -> Result<usize, AppError> {
    let course = get_course(db, id).await?;
    let files = get_course_files(db, id).await?;

    db.run_batch(vec![
        Statement::query("DELETE FROM files WHERE course_id = ?", params![id]),
        Statement::query("DELETE FROM assigned_courses WHERE course_id = ?", params![id]),
        Statement::query("DELETE FROM courses WHERE id = ?", params![id]),
    ])
    .await?;

    let mut removed = 0;
    for file in &files {
        if uploads.remove(&file.file_path).await {
            removed += 1;
        }
    }

    info!(title = %course.title, files = files.len(), removed, "Course deleted");
    Ok(removed)
}

/// Replaces every assignment of a course with `student_ids`. Duplicate and
/// unknown ids are skipped. Returns how many students are now assigned.
#[instrument(skip(db, student_ids), fields(requested = student_ids.len()))]
pub async fn assign_course(
    db: &Database,
    course_id: i64,
    student_ids: &[i64],
) -> Result<usize, AppError> {
    get_course(db, course_id).await?;

    let known: HashSet<i64> = get_students(db).await?.into_iter().map(|s| s.id).collect();

    let mut seen = HashSet::new();
    let mut statements = vec![Statement::query(
        "DELETE FROM assigned_courses WHERE course_id = ?",
        params![course_id],
    )];

    for student_id in student_ids {
        if !seen.insert(*student_id) {
            continue;
        }
        if !known.contains(student_id) {
            warn!(student_id, "Skipping assignment for unknown student");
            continue;
        }
        statements.push(Statement::insert(
            Table::Assignments,
            vec![("user_id", (*student_id).into()), ("course_id", course_id.into())],
        ));
    }

    let assigned = statements.len() - 1;
    db.run_batch(statements).await?;

    info!(assigned, "Course assignments replaced");
    Ok(assigned)
}

/// Assigns one student to a course. Returns `false` when already assigned.
#[instrument(skip(db))]
pub async fn assign_student(db: &Database, course_id: i64, user_id: i64) -> Result<bool, AppError> {
    if is_assigned(db, user_id, course_id).await? {
        return Ok(false);
    }

    db.insert(
        Table::Assignments,
        vec![("user_id", user_id.into()), ("course_id", course_id.into())],
    )
    .await?;

    Ok(true)
}

#[instrument(skip(db))]
pub async fn add_file(
    db: &Database,
    course_id: i64,
    filename: &str,
    file_path: &str,
) -> Result<CourseFile, AppError> {
    get_course(db, course_id).await?;

    let id = db
        .insert(
            Table::Files,
            vec![
                ("course_id", course_id.into()),
                ("filename", filename.into()),
                ("file_path", file_path.into()),
            ],
        )
        .await?;

    info!(id, "File recorded");
    get_file(db, id).await
}

#[instrument(skip(db))]
pub async fn get_file(db: &Database, id: i64) -> Result<CourseFile, AppError> {
    let row = db
        .fetch_one(
            &format!("SELECT {} FROM files WHERE id = ?", FILE_COLUMNS),
            params![id],
        )
        .await?;

    match row {
        Some(row) => Ok(row.decode()?),
        _ => Err(AppError::NotFound("File not found".to_string())),
    }
}

#[instrument(skip(db, user), fields(user_id = user.id))]
pub async fn get_file_for(db: &Database, user: &User, id: i64) -> Result<CourseFile, AppError> {
    let file = get_file(db, id).await?;
    require_course_access(db, user, file.course_id).await?;
    Ok(file)
}

#[instrument(skip(db, uploads))]
pub async fn delete_file(db: &Database, uploads: &UploadStore, id: i64) -> Result<CourseFile, AppError> {
    let file = get_file(db, id).await?;

    db.execute("DELETE FROM files WHERE id = ?", params![id]).await?;
    uploads.remove(&file.file_path).await;

    info!(path = %file.file_path, "File deleted");
    Ok(file)
}

/// Creates the demo accounts and course on an empty store. Returns `false`
/// when users already exist.
#[instrument(skip(db))]
pub async fn seed_sample_data(db: &Database) -> Result<bool, AppError> {
    if db.count_users().await? > 0 {
        return Ok(false);
    }

    create_user(db, "admin@example.com", "admin123", Role::Admin).await?;
    let student1 = create_user(db, "student1@example.com", "student123", Role::Student).await?;
    let student2 = create_user(db, "student2@example.com", "student123", Role::Student).await?;

    let course_id = create_course(
        db,
        CourseDraft {
            title: Some("Sample Sloka Course".to_string()),
            description: Some(
                "A sample course to demonstrate the Sloka Course Management System".to_string(),
            ),
            content_richtext: Some(
                "<h2>Welcome to Sloka Course Management</h2><p>This is a sample course with rich text content.</p>"
                    .to_string(),
            ),
            lyrics: Some("Sample lyrics content for the course".to_string()),
            audio: None,
        },
    )
    .await?;

    assign_course(db, course_id, &[student1, student2]).await?;

    info!("Sample data created: admin@example.com, student1@example.com, student2@example.com");
    Ok(true)
}
