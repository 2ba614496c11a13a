//! Model types `lqctl` knows how to observe.

use clap::ValueEnum;
use livequery_core::{FieldAccessor, FieldValue, Model};
use serde::{Deserialize, Serialize};

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum ModelKind {
    BlogOwner,
    Post,
}

impl ModelKind {
    pub fn model_name(self) -> &'static str {
        match self {
            ModelKind::BlogOwner => BlogOwner::MODEL_NAME,
            ModelKind::Post => Post::MODEL_NAME,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlogOwner {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wea: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<i64>,
}

impl Model for BlogOwner {
    const MODEL_NAME: &'static str = "BlogOwner";
    fn primary_key(&self) -> String { self.id.clone() }
    fn field_accessor(field: &str) -> Option<FieldAccessor<Self>> {
        match field {
            "id" => Some(|b: &BlogOwner| FieldValue::from(b.id.as_str())),
            "name" => Some(|b: &BlogOwner| FieldValue::from(b.name.as_str())),
            "wea" => Some(|b: &BlogOwner| FieldValue::from(b.wea.clone())),
            "rating" => Some(|b: &BlogOwner| FieldValue::from(b.rating)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    pub title: String,
    #[serde(default, rename = "blogOwnerId", skip_serializing_if = "Option::is_none")]
    pub blog_owner_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<f64>,
    #[serde(default)]
    pub draft: bool,
}

impl Model for Post {
    const MODEL_NAME: &'static str = "Post";
    fn primary_key(&self) -> String { self.id.clone() }
    fn field_accessor(field: &str) -> Option<FieldAccessor<Self>> {
        match field {
            "id" => Some(|p: &Post| FieldValue::from(p.id.as_str())),
            "title" => Some(|p: &Post| FieldValue::from(p.title.as_str())),
            "blogOwnerId" => Some(|p: &Post| FieldValue::from(p.blog_owner_id.clone())),
            "rating" => Some(|p: &Post| FieldValue::from(p.rating)),
            "draft" => Some(|p: &Post| FieldValue::from(p.draft)),
            _ => None,
        }
    }
}
