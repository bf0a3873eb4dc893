use serde::Serialize;

use super::backend::Backend;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Users,
    Courses,
    Assignments,
    Files,
}

impl Table {
    pub const ALL: [Table; 4] = [Table::Users, Table::Courses, Table::Assignments, Table::Files];

    pub fn name(&self) -> &'static str {
        match self {
            Table::Users => "users",
            Table::Courses => "courses",
            Table::Assignments => "assigned_courses",
            Table::Files => "files",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Table::ALL.into_iter().find(|table| table.name() == name)
    }
}

pub const EMBEDDED_SCHEMA: &[&str] = &[
    r#"
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY,
    email TEXT NOT NULL UNIQUE,
    hashed_password TEXT NOT NULL,
    role TEXT NOT NULL CHECK (role IN ('admin', 'student')),
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
)"#,
    r#"
CREATE TABLE IF NOT EXISTS courses (
    id INTEGER PRIMARY KEY,
    title TEXT NOT NULL,
    description TEXT,
    content_richtext TEXT,
    lyrics TEXT,
    audio TEXT,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
)"#,
    r#"
CREATE TABLE IF NOT EXISTS assigned_courses (
    id INTEGER PRIMARY KEY,
    user_id INTEGER NOT NULL,
    course_id INTEGER NOT NULL,
    assigned_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    FOREIGN KEY (user_id) REFERENCES users (id) ON DELETE CASCADE,
    FOREIGN KEY (course_id) REFERENCES courses (id) ON DELETE CASCADE,
    UNIQUE (user_id, course_id)
)"#,
    r#"
CREATE TABLE IF NOT EXISTS files (
    id INTEGER PRIMARY KEY,
    course_id INTEGER NOT NULL,
    filename TEXT NOT NULL,
    file_path TEXT NOT NULL,
    uploaded_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    FOREIGN KEY (course_id) REFERENCES courses (id) ON DELETE CASCADE
)"#,
    "CREATE INDEX IF NOT EXISTS idx_assigned_courses_course ON assigned_courses (course_id)",
    "CREATE INDEX IF NOT EXISTS idx_files_course ON files (course_id)",
];

// BIGSERIAL keeps ids INT8 so they decode the same way as the embedded store.
pub const EXTERNAL_SCHEMA: &[&str] = &[
    r#"
CREATE TABLE IF NOT EXISTS users (
    id BIGSERIAL PRIMARY KEY,
    email VARCHAR(255) UNIQUE NOT NULL,
    hashed_password VARCHAR(255) NOT NULL,
    role VARCHAR(50) NOT NULL CHECK (role IN ('admin', 'student')),
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
)"#,
    r#"
CREATE TABLE IF NOT EXISTS courses (
    id BIGSERIAL PRIMARY KEY,
    title VARCHAR(255) NOT NULL,
    description TEXT,
    content_richtext TEXT,
    lyrics TEXT,
    audio TEXT,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
)"#,
    r#"
CREATE TABLE IF NOT EXISTS assigned_courses (
    id BIGSERIAL PRIMARY KEY,
    user_id BIGINT NOT NULL REFERENCES users (id) ON DELETE CASCADE,
    course_id BIGINT NOT NULL REFERENCES courses (id) ON DELETE CASCADE,
    assigned_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    UNIQUE (user_id, course_id)
)"#,
    r#"
CREATE TABLE IF NOT EXISTS files (
    id BIGSERIAL PRIMARY KEY,
    course_id BIGINT NOT NULL REFERENCES courses (id) ON DELETE CASCADE,
    filename VARCHAR(255) NOT NULL,
    file_path VARCHAR(500) NOT NULL,
    uploaded_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
)"#,
    "CREATE INDEX IF NOT EXISTS idx_assigned_courses_course ON assigned_courses (course_id)",
    "CREATE INDEX IF NOT EXISTS idx_files_course ON files (course_id)",
];

pub fn schema_for(backend: Backend) -> &'static [&'static str] {
    match backend {
        Backend::ExternalRelational => EXTERNAL_SCHEMA,
        Backend::Embedded | Backend::EmbeddedWithSync => EMBEDDED_SCHEMA,
    }
}
