#![forbid(unsafe_code)]

use crate::ids::ClientId;
use serde::{Deserialize, Serialize};

const MAX_TITLE_LEN: usize = 512;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Task,
    Category,
}

impl EntityKind {
    /// Pull order: categories first so task category references resolve.
    pub const ALL: [EntityKind; 2] = [EntityKind::Category, EntityKind::Task];

    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Task => "task",
            EntityKind::Category => "category",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "task" => Some(EntityKind::Task),
            "category" => Some(EntityKind::Category),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    Medium,
    High,
}

impl TaskPriority {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskPriority::Low => "low",
            TaskPriority::Medium => "medium",
            TaskPriority::High => "high",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "low" => Some(TaskPriority::Low),
            "medium" => Some(TaskPriority::Medium),
            "high" => Some(TaskPriority::High),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(TaskStatus::Pending),
            "in_progress" => Some(TaskStatus::InProgress),
            "completed" => Some(TaskStatus::Completed),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFields {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category_id: Option<ClientId>,
    #[serde(default)]
    pub progress_percentage: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at_ms: Option<i64>,
}

impl TaskFields {
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryFields {
    pub name: String,
    pub color: String,
    #[serde(default)]
    pub sort_order: i64,
}

/// Domain payload of an entity. The variant decides the entity kind.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntityFields {
    Task(TaskFields),
    Category(CategoryFields),
}

impl EntityFields {
    pub fn kind(&self) -> EntityKind {
        match self {
            EntityFields::Task(_) => EntityKind::Task,
            EntityFields::Category(_) => EntityKind::Category,
        }
    }

    pub fn as_task(&self) -> Option<&TaskFields> {
        match self {
            EntityFields::Task(task) => Some(task),
            EntityFields::Category(_) => None,
        }
    }

    pub fn as_category(&self) -> Option<&CategoryFields> {
        match self {
            EntityFields::Category(category) => Some(category),
            EntityFields::Task(_) => None,
        }
    }

    pub fn validate(&self) -> Result<(), FieldError> {
        match self {
            EntityFields::Task(task) => {
                let title = task.title.trim();
                if title.is_empty() {
                    return Err(FieldError::EmptyTitle);
                }
                if title.len() > MAX_TITLE_LEN {
                    return Err(FieldError::TitleTooLong);
                }
                if task.progress_percentage > 100 {
                    return Err(FieldError::ProgressOutOfRange);
                }
                Ok(())
            }
            EntityFields::Category(category) => {
                if category.name.trim().is_empty() {
                    return Err(FieldError::EmptyName);
                }
                if !is_hex_color(&category.color) {
                    return Err(FieldError::InvalidColor);
                }
                Ok(())
            }
        }
    }
}

fn is_hex_color(value: &str) -> bool {
    let Some(hex) = value.strip_prefix('#') else {
        return false;
    };
    matches!(hex.len(), 3 | 6) && hex.bytes().all(|b| b.is_ascii_hexdigit())
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FieldError {
    EmptyTitle,
    TitleTooLong,
    ProgressOutOfRange,
    EmptyName,
    InvalidColor,
}

impl FieldError {
    pub fn message(&self) -> &'static str {
        match self {
            Self::EmptyTitle => "task title must not be empty",
            Self::TitleTooLong => "task title is too long",
            Self::ProgressOutOfRange => "progress_percentage must be within 0..=100",
            Self::EmptyName => "category name must not be empty",
            Self::InvalidColor => "category color must be #rgb or #rrggbb",
        }
    }
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message())
    }
}

impl std::error::Error for FieldError {}
