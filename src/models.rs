use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Course {
    pub id: i64,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub content_richtext: Option<String>,
    #[serde(default)]
    pub lyrics: Option<String>,
    #[serde(default)]
    pub audio: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CourseFile {
    pub id: i64,
    pub course_id: i64,
    pub filename: String,
    /// Where the bytes live in the upload store. Never sent to clients.
    #[serde(skip_serializing, default)]
    pub file_path: String,
    #[serde(default)]
    pub uploaded_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CourseWithFiles {
    #[serde(flatten)]
    pub course: Course,
    pub files: Vec<CourseFile>,
}

/// Fields for a new course, or the changes to an existing one.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CourseDraft {
    pub title: Option<String>,
    pub description: Option<String>,
    pub content_richtext: Option<String>,
    pub lyrics: Option<String>,
    pub audio: Option<String>,
}

impl CourseDraft {
    /// Overlays the provided fields on `course`; missing ones keep their value.
    pub fn merge_into(self, course: Course) -> Course {
        Course {
            title: self.title.unwrap_or(course.title),
            description: self.description.or(course.description),
            content_richtext: self.content_richtext.or(course.content_richtext),
            lyrics: self.lyrics.or(course.lyrics),
            audio: self.audio.or(course.audio),
            ..course
        }
    }
}
