//! Store bindings for the shared records.

use aigc_common::{Model, Service, ServiceProvider};
use chrono::{DateTime, Utc};
use serde_json::Value;

use super::Entity;

fn push_text(index: &mut Vec<(&'static str, Value)>, column: &'static str, value: &str) {
    if !value.is_empty() {
        index.push((column, Value::from(value)));
    }
}

impl Entity for Service {
    fn table_name() -> &'static str {
        "service"
    }

    fn primary_key() -> &'static str {
        "name"
    }

    fn columns() -> &'static [&'static str] {
        &[
            "name",
            "hybrid_policy",
            "remote_provider",
            "local_provider",
            "status",
            "created_at",
            "updated_at",
        ]
    }

    fn index(&self) -> Vec<(&'static str, Value)> {
        let mut index = Vec::new();
        push_text(&mut index, "name", &self.name);
        index
    }

    fn set_create_time(&mut self, at: DateTime<Utc>) {
        self.created_at = at;
    }

    fn set_update_time(&mut self, at: DateTime<Utc>) {
        self.updated_at = at;
    }
}

impl Entity for ServiceProvider {
    fn table_name() -> &'static str {
        "service_provider"
    }

    fn primary_key() -> &'static str {
        "id"
    }

    fn columns() -> &'static [&'static str] {
        &[
            "id",
            "provider_name",
            "service_name",
            "service_source",
            "desc",
            "method",
            "url",
            "auth_type",
            "auth_key",
            "flavor",
            "extra_headers",
            "extra_json_body",
            "properties",
            "status",
            "created_at",
            "updated_at",
        ]
    }

    fn index(&self) -> Vec<(&'static str, Value)> {
        let mut index = Vec::new();
        push_text(&mut index, "provider_name", &self.provider_name);
        push_text(&mut index, "service_source", &self.service_source);
        push_text(&mut index, "service_name", &self.service_name);
        push_text(&mut index, "flavor", &self.flavor);
        index
    }

    fn set_create_time(&mut self, at: DateTime<Utc>) {
        self.created_at = at;
    }

    fn set_update_time(&mut self, at: DateTime<Utc>) {
        self.updated_at = at;
    }

    fn assign_row_id(&mut self, id: i64) {
        self.id = id;
    }
}

impl Entity for Model {
    fn table_name() -> &'static str {
        "model"
    }

    fn primary_key() -> &'static str {
        "id"
    }

    fn columns() -> &'static [&'static str] {
        &[
            "id",
            "model_name",
            "provider_name",
            "status",
            "created_at",
            "updated_at",
        ]
    }

    fn index(&self) -> Vec<(&'static str, Value)> {
        let mut index = Vec::new();
        push_text(&mut index, "model_name", &self.model_name);
        push_text(&mut index, "provider_name", &self.provider_name);
        index
    }

    fn set_create_time(&mut self, at: DateTime<Utc>) {
        self.created_at = at;
    }

    fn set_update_time(&mut self, at: DateTime<Utc>) {
        self.updated_at = at;
    }

    fn assign_row_id(&mut self, id: i64) {
        self.id = id;
    }
}
