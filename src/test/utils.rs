use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Once, PoisonError};

use rocket::http::{ContentType, Status};
use rocket::local::asynchronous::Client;
use serde_json::json;
use tempfile::TempDir;

use crate::auth::Role;
use crate::config::StorageConfig;
use crate::db::{assign_student, create_course, create_user};
use crate::error::AppError;
use crate::init_rocket;
use crate::models::CourseDraft;
use crate::storage::blob::{BlobError, BlobProvider};
use crate::storage::{Database, MemoryBackup};
use crate::uploads::UploadStore;

static INIT: Once = Once::new();
pub static STANDARD_PASSWORD: &str = "password123";

pub fn init_logging() {
    INIT.call_once(|| {
        let _ = env_logger::builder()
            .parse_filters("debug")
            .is_test(true)
            .try_init();
    });
}

impl CourseDraft {
    pub fn titled(title: &str) -> Self {
        Self {
            title: Some(title.to_string()),
            ..Self::default()
        }
    }
}

impl UploadStore {
    pub async fn save_bytes(&self, filename: &str, bytes: &[u8]) -> Result<PathBuf, AppError> {
        let path = self.prepare(filename).await?;
        tokio::fs::write(&path, bytes).await?;
        Ok(path)
    }
}

/// Storage configuration rooted entirely inside `dir`.
pub fn test_config(dir: &TempDir) -> StorageConfig {
    let mut config = StorageConfig::embedded(dir.path().join("test.db"));
    config.upload_folder = dir.path().join("uploads");
    config.mirror.primary_dir = dir.path().join("json_backup");
    config.mirror.fallback_dir = dir.path().join("json_backup_fallback");
    config
}

pub struct TestUser {
    pub email: String,
    pub role: Role,
    pub password: String,
}

pub struct TestCourse {
    pub title: String,
    pub description: Option<String>,
}

#[derive(Default)]
pub struct TestDbBuilder {
    users: Vec<TestUser>,
    courses: Vec<TestCourse>,
    assignments: Vec<(String, String)>,
    mirror_disabled: bool,
    memory: Option<MemoryBackup>,
}

impl TestDbBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn student(self, email: &str) -> Self {
        self.user_with_password(email, Role::Student, STANDARD_PASSWORD)
    }

    pub fn admin(self, email: &str) -> Self {
        self.user_with_password(email, Role::Admin, STANDARD_PASSWORD)
    }

    pub fn user_with_password(mut self, email: &str, role: Role, password: &str) -> Self {
        self.users.push(TestUser {
            email: email.to_string(),
            role,
            password: password.to_string(),
        });
        self
    }

    pub fn course(mut self, title: &str, description: Option<&str>) -> Self {
        self.courses.push(TestCourse {
            title: title.to_string(),
            description: description.map(String::from),
        });
        self
    }

    pub fn assign(mut self, course_title: &str, student_email: &str) -> Self {
        self.assignments
            .push((course_title.to_string(), student_email.to_string()));
        self
    }

    pub fn without_mirror(mut self) -> Self {
        self.mirror_disabled = true;
        self
    }

    pub fn memory_backup(mut self, memory: MemoryBackup) -> Self {
        self.memory = Some(memory);
        self
    }

    pub async fn build(self) -> Result<TestDb, AppError> {
        init_logging();

        let dir = tempfile::tempdir()?;
        let mut config = test_config(&dir);
        config.mirror.enabled = !self.mirror_disabled;

        let uploads = UploadStore::from_config(&config);
        let mut db = Database::new(config.clone());
        if let Some(memory) = self.memory {
            db = db.with_memory_backup(memory);
        }
        db.ensure_schema().await?;

        let mut user_id_map = HashMap::new();
        for user in &self.users {
            let id = create_user(&db, &user.email, &user.password, user.role).await?;
            user_id_map.insert(user.email.clone(), id);
        }

        let mut course_id_map = HashMap::new();
        for course in &self.courses {
            let id = create_course(
                &db,
                CourseDraft {
                    description: course.description.clone(),
                    ..CourseDraft::titled(&course.title)
                },
            )
            .await?;
            course_id_map.insert(course.title.clone(), id);
        }

        for (title, email) in &self.assignments {
            if let (Some(course_id), Some(user_id)) =
                (course_id_map.get(title), user_id_map.get(email))
            {
                assign_student(&db, *course_id, *user_id).await?;
            }
        }

        Ok(TestDb {
            db,
            uploads,
            config,
            dir,
            user_id_map,
            course_id_map,
        })
    }
}

pub struct TestDb {
    pub db: Database,
    pub uploads: UploadStore,
    pub config: StorageConfig,
    pub dir: TempDir,
    pub user_id_map: HashMap<String, i64>,
    pub course_id_map: HashMap<String, i64>,
}

impl TestDb {
    pub fn user_id(&self, email: &str) -> i64 {
        self.user_id_map[email]
    }

    pub fn course_id(&self, title: &str) -> i64 {
        self.course_id_map[title]
    }
}

/// What stays with the test once the database moves into Rocket.
pub struct TestContext {
    pub dir: TempDir,
    pub config: StorageConfig,
    pub user_id_map: HashMap<String, i64>,
    pub course_id_map: HashMap<String, i64>,
}

impl TestContext {
    pub fn user_id(&self, email: &str) -> i64 {
        self.user_id_map[email]
    }

    pub fn course_id(&self, title: &str) -> i64 {
        self.course_id_map[title]
    }
}

pub async fn create_standard_test_db() -> TestDb {
    TestDbBuilder::new()
        .admin("admin@test.com")
        .student("student1@test.com")
        .student("student2@test.com")
        .course("Vishnu Sahasranamam", Some("Thousand names"))
        .course("Hanuman Chalisa", None)
        .assign("Vishnu Sahasranamam", "student1@test.com")
        .build()
        .await
        .expect("Failed to create standard test database")
}

pub async fn setup_test_client(test_db: TestDb) -> (Client, TestContext) {
    let TestDb {
        db,
        uploads,
        config,
        dir,
        user_id_map,
        course_id_map,
    } = test_db;

    let rocket = init_rocket(db, uploads).await;
    let client = Client::tracked(rocket)
        .await
        .expect("Failed to create test client");

    (
        client,
        TestContext {
            dir,
            config,
            user_id_map,
            course_id_map,
        },
    )
}

pub async fn login_test_user(client: &Client, email: &str, password: &str) {
    let response = client
        .post("/api/login")
        .header(ContentType::JSON)
        .body(json!({ "email": email, "password": password }).to_string())
        .dispatch()
        .await;

    assert_eq!(response.status(), Status::Ok, "login failed for {}", email);
}

/// In-process blob store recording every upload.
#[derive(Default)]
pub struct FakeBlobProvider {
    pub object: Mutex<Option<Vec<u8>>>,
    pub uploads: Mutex<Vec<Vec<u8>>>,
    pub fetches: Mutex<usize>,
    pub fail_fetch: bool,
}

impl FakeBlobProvider {
    pub fn with_object(bytes: &[u8]) -> Self {
        Self {
            object: Mutex::new(Some(bytes.to_vec())),
            ..Self::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail_fetch: true,
            ..Self::default()
        }
    }

    pub fn upload_count(&self) -> usize {
        self.uploads.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn fetch_count(&self) -> usize {
        *self.fetches.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }
}

#[rocket::async_trait]
impl BlobProvider for FakeBlobProvider {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn key(&self) -> &str {
        "test.db"
    }

    async fn fetch(&self) -> Result<Option<Vec<u8>>, BlobError> {
        *self.fetches.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        if self.fail_fetch {
            return Err(BlobError::Request("connection refused".to_string()));
        }
        Ok(self
            .object
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    async fn store(&self, bytes: Vec<u8>) -> Result<(), BlobError> {
        *self.object.lock().unwrap_or_else(PoisonError::into_inner) = Some(bytes.clone());
        self.uploads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(bytes);
        Ok(())
    }
}
