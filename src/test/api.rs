#[cfg(test)]
mod tests {
    use rocket::http::{ContentType, Status};
    use rocket::local::asynchronous::Client;
    use serde_json::{Value, json};

    use crate::api::{
        AssignResponse, AuthStatusResponse, CourseCreatedResponse, CourseResponse,
        CoursesResponse, FileUploadedResponse, LoginResponse, MeResponse, StudentsResponse,
    };
    use crate::config::StorageConfig;
    use crate::init_rocket;
    use crate::storage::Database;
    use crate::test::utils::{
        STANDARD_PASSWORD, create_standard_test_db, init_logging, login_test_user,
        setup_test_client,
    };
    use crate::uploads::UploadStore;
    use crate::validation::ValidationResponse;

    const BOUNDARY: &str = "sloka-test-boundary";

    fn multipart_body(filename: &str, contents: &str) -> String {
        format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{f}\"\r\nContent-Type: application/octet-stream\r\n\r\n{c}\r\n--{b}--\r\n",
            b = BOUNDARY,
            f = filename,
            c = contents
        )
    }

    fn multipart_type() -> ContentType {
        ContentType::new("multipart", "form-data").with_params(("boundary", BOUNDARY))
    }

    async fn body_json<T: serde::de::DeserializeOwned>(
        response: rocket::local::asynchronous::LocalResponse<'_>,
    ) -> T {
        let body = response.into_string().await.expect("response body");
        serde_json::from_str(&body).unwrap_or_else(|e| panic!("{}: {}", e, body))
    }

    #[rocket::async_test]
    async fn test_login_api() {
        let (client, _ctx) = setup_test_client(create_standard_test_db().await).await;

        let response = client
            .post("/api/login")
            .header(ContentType::JSON)
            .body(json!({ "email": "admin@test.com", "password": STANDARD_PASSWORD }).to_string())
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Ok);

        let login: LoginResponse = body_json(response).await;
        assert_eq!(login.user.email, "admin@test.com");
        assert_eq!(login.user.role, "admin");

        let response = client
            .post("/api/login")
            .header(ContentType::JSON)
            .body(json!({ "email": "admin@test.com", "password": "wrong" }).to_string())
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Unauthorized);

        let error: ValidationResponse = body_json(response).await;
        assert_eq!(error.errors["authentication"], vec!["Invalid credentials"]);
    }

    #[rocket::async_test]
    async fn test_login_requires_both_fields() {
        let (client, _ctx) = setup_test_client(create_standard_test_db().await).await;

        let response = client
            .post("/api/login")
            .header(ContentType::JSON)
            .body(json!({ "email": "", "password": "" }).to_string())
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::UnprocessableEntity);
    }

    #[rocket::async_test]
    async fn test_session_lifecycle() {
        let (client, _ctx) = setup_test_client(create_standard_test_db().await).await;

        let status: AuthStatusResponse =
            body_json(client.get("/api/check-auth").dispatch().await).await;
        assert!(!status.authenticated);
        assert!(status.user.is_none());

        let response = client.get("/api/me").dispatch().await;
        assert_eq!(response.status(), Status::Unauthorized);

        login_test_user(&client, "student1@test.com", STANDARD_PASSWORD).await;

        let status: AuthStatusResponse =
            body_json(client.get("/api/check-auth").dispatch().await).await;
        assert!(status.authenticated);

        let me: MeResponse = body_json(client.get("/api/me").dispatch().await).await;
        assert_eq!(me.user.email, "student1@test.com");
        assert_eq!(me.user.role, "student");

        let response = client.post("/api/logout").dispatch().await;
        assert_eq!(response.status(), Status::Ok);

        let response = client.get("/api/me").dispatch().await;
        assert_eq!(response.status(), Status::Unauthorized);
    }

    #[rocket::async_test]
    async fn test_signup() {
        let (client, _ctx) = setup_test_client(create_standard_test_db().await).await;

        let response = client
            .post("/api/signup")
            .header(ContentType::JSON)
            .body(json!({ "email": "not-an-email", "password": "pw" }).to_string())
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::UnprocessableEntity);
        let error: ValidationResponse = body_json(response).await;
        assert_eq!(error.errors["email"], vec!["Invalid email format"]);

        let response = client
            .post("/api/signup")
            .header(ContentType::JSON)
            .body(json!({ "email": "student1@test.com", "password": "pw" }).to_string())
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Conflict);

        let response = client
            .post("/api/signup")
            .header(ContentType::JSON)
            .body(json!({ "email": "new@test.com", "password": "pw" }).to_string())
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Created);
        let signup: LoginResponse = body_json(response).await;
        assert_eq!(signup.user.role, "student");

        let me: MeResponse = body_json(client.get("/api/me").dispatch().await).await;
        assert_eq!(me.user.email, "new@test.com");
    }

    #[rocket::async_test]
    async fn test_auth_required_apis() {
        let (client, _ctx) = setup_test_client(create_standard_test_db().await).await;

        for endpoint in ["/api/courses", "/api/students", "/api/admin/backup/status"] {
            let response = client.get(endpoint).dispatch().await;
            assert_eq!(
                response.status(),
                Status::Unauthorized,
                "Endpoint {} did not require authentication",
                endpoint
            );
        }
    }

    #[rocket::async_test]
    async fn test_student_sees_only_assigned_courses() {
        let (client, ctx) = setup_test_client(create_standard_test_db().await).await;
        login_test_user(&client, "student1@test.com", STANDARD_PASSWORD).await;

        let courses: CoursesResponse = body_json(client.get("/api/courses").dispatch().await).await;
        assert_eq!(courses.courses.len(), 1);
        assert_eq!(courses.courses[0].course.title, "Vishnu Sahasranamam");

        let hidden = ctx.course_id("Hanuman Chalisa");
        let response = client
            .get(format!("/api/courses/{}", hidden))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Forbidden);

        let response = client
            .post("/api/courses")
            .header(ContentType::JSON)
            .body(json!({ "title": "Not allowed" }).to_string())
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Forbidden);

        let response = client.get("/api/students").dispatch().await;
        assert_eq!(response.status(), Status::Forbidden);
    }

    #[rocket::async_test]
    async fn test_admin_course_management() {
        let (client, _ctx) = setup_test_client(create_standard_test_db().await).await;
        login_test_user(&client, "admin@test.com", STANDARD_PASSWORD).await;

        let response = client
            .post("/api/courses")
            .header(ContentType::JSON)
            .body(json!({ "description": "No title" }).to_string())
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::BadRequest);

        let response = client
            .post("/api/courses")
            .header(ContentType::JSON)
            .body(json!({ "title": "Durga Suktam", "lyrics": "jatavedase" }).to_string())
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Created);
        let created: CourseCreatedResponse = body_json(response).await;

        let response = client
            .put(format!("/api/courses/{}", created.course_id))
            .header(ContentType::JSON)
            .body(json!({ "title": "Sri Durga Suktam" }).to_string())
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Ok);

        let course: CourseResponse = body_json(
            client
                .get(format!("/api/courses/{}", created.course_id))
                .dispatch()
                .await,
        )
        .await;
        assert_eq!(course.course.course.title, "Sri Durga Suktam");
        assert_eq!(course.course.course.lyrics.as_deref(), Some("jatavedase"));

        let courses: CoursesResponse = body_json(client.get("/api/courses").dispatch().await).await;
        assert_eq!(courses.courses.len(), 3);

        let response = client
            .delete(format!("/api/courses/{}", created.course_id))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Ok);

        let response = client
            .get(format!("/api/courses/{}", created.course_id))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::NotFound);
    }

    #[rocket::async_test]
    async fn test_assign_course_api() {
        let (client, ctx) = setup_test_client(create_standard_test_db().await).await;
        login_test_user(&client, "admin@test.com", STANDARD_PASSWORD).await;

        let course = ctx.course_id("Hanuman Chalisa");
        let student1 = ctx.user_id("student1@test.com");
        let student2 = ctx.user_id("student2@test.com");

        let students: StudentsResponse =
            body_json(client.get("/api/students").dispatch().await).await;
        assert_eq!(students.students.len(), 2);

        let response = client
            .post(format!("/api/courses/{}/assign", course))
            .header(ContentType::JSON)
            .body(json!({ "student_ids": [student1, student2, student2] }).to_string())
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Ok);
        let assigned: AssignResponse = body_json(response).await;
        assert_eq!(assigned.assigned, 2);

        let enrolled: StudentsResponse = body_json(
            client
                .get(format!("/api/courses/{}/assignments", course))
                .dispatch()
                .await,
        )
        .await;
        assert_eq!(enrolled.students.len(), 2);

        let response = client
            .post(format!("/api/courses/{}/students/{}", course, student1))
            .dispatch()
            .await;
        let single: Value = body_json(response).await;
        assert_eq!(single["created"], false);

        let admin = ctx.user_id("admin@test.com");
        let response = client
            .post(format!("/api/courses/{}/students/{}", course, admin))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::BadRequest);

        let response = client
            .post(format!("/api/courses/{}/assign", course))
            .header(ContentType::JSON)
            .body(json!({ "student_ids": [] }).to_string())
            .dispatch()
            .await;
        let cleared: AssignResponse = body_json(response).await;
        assert_eq!(cleared.assigned, 0);
    }

    #[rocket::async_test]
    async fn test_upload_and_download_file() {
        let (client, ctx) = setup_test_client(create_standard_test_db().await).await;
        let course = ctx.course_id("Vishnu Sahasranamam");

        login_test_user(&client, "admin@test.com", STANDARD_PASSWORD).await;

        let response = client
            .post(format!("/api/courses/{}/upload", course))
            .header(multipart_type())
            .body(multipart_body("malware.exe", "MZ"))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::BadRequest);

        let response = client
            .post(format!("/api/courses/{}/upload", course))
            .header(multipart_type())
            .body(multipart_body("Chant Notes.txt", "om shanti"))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Created);
        let uploaded: FileUploadedResponse = body_json(response).await;
        assert_eq!(uploaded.file.filename, "Chant Notes.txt");
        assert!(uploaded.file.file_path.is_empty());

        let stored: Vec<_> = std::fs::read_dir(ctx.config.upload_folder.clone())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(stored.len(), 1);
        assert!(stored[0].ends_with("_Chant_Notes.txt"));

        client.post("/api/logout").dispatch().await;
        login_test_user(&client, "student1@test.com", STANDARD_PASSWORD).await;

        let response = client
            .get(format!("/api/files/{}/download", uploaded.file.id))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Ok);
        assert_eq!(
            response.headers().get_one("Content-Disposition"),
            Some("attachment; filename=\"Chant Notes.txt\"")
        );
        assert_eq!(response.into_string().await.unwrap(), "om shanti");

        client.post("/api/logout").dispatch().await;
        login_test_user(&client, "student2@test.com", STANDARD_PASSWORD).await;

        let response = client
            .get(format!("/api/files/{}/download", uploaded.file.id))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Forbidden);

        let response = client
            .delete(format!("/api/files/{}", uploaded.file.id))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Forbidden);
    }

    #[rocket::async_test]
    async fn test_backup_endpoints() {
        let (client, ctx) = setup_test_client(create_standard_test_db().await).await;

        login_test_user(&client, "student1@test.com", STANDARD_PASSWORD).await;
        let response = client.post("/api/admin/backup").dispatch().await;
        assert_eq!(response.status(), Status::Forbidden);
        client.post("/api/logout").dispatch().await;

        login_test_user(&client, "admin@test.com", STANDARD_PASSWORD).await;

        let report: Value = body_json(client.post("/api/admin/backup").dispatch().await).await;
        assert_eq!(report["written"], 5);
        assert_eq!(report["failed"], 0);
        assert!(ctx.config.mirror.primary_dir.join("courses.json").exists());

        let status: Value =
            body_json(client.get("/api/admin/backup/status").dispatch().await).await;
        assert_eq!(status["enabled"], true);
        assert_eq!(status["snapshots"].as_array().map(Vec::len), Some(5));

        let restore: Value = body_json(client.post("/api/admin/restore").dispatch().await).await;
        assert_eq!(restore["restored"], 0);
    }

    #[rocket::async_test]
    async fn test_health_reports_backend() {
        let (client, _ctx) = setup_test_client(create_standard_test_db().await).await;

        let health: Value = body_json(client.get("/api/health").dispatch().await).await;
        assert_eq!(health["status"], "ok");
        assert_eq!(health["storage"]["backend"], "embedded");
        assert_eq!(health["storage"]["blob_provider"], Value::Null);
        assert_eq!(health["storage"]["json_backup_enabled"], true);
    }

    #[rocket::async_test]
    async fn test_unavailable_storage_returns_503() {
        init_logging();
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"x").unwrap();

        let config = StorageConfig::embedded(blocker.join("app.db"));
        let uploads = UploadStore::new(dir.path().join("uploads"));
        let client = Client::tracked(init_rocket(Database::new(config), uploads).await)
            .await
            .unwrap();

        let response = client
            .post("/api/login")
            .header(ContentType::JSON)
            .body(json!({ "email": "admin@test.com", "password": "pw" }).to_string())
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::ServiceUnavailable);

        let error: ValidationResponse = body_json(response).await;
        assert_eq!(
            error.errors["service"],
            vec!["Service temporarily unavailable"]
        );
    }
}
