//! Table schemas for the raw game tables and the relaxation rules applied
//! when a load brings a schema that differs from the table's.

use std::fmt;

use chesslake_core::Platform;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FieldType {
    String,
    Integer,
    Float,
    Boolean,
    Datetime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FieldMode {
    Required,
    Nullable,
    Repeated,
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FieldType::String => "STRING",
            FieldType::Integer => "INTEGER",
            FieldType::Float => "FLOAT",
            FieldType::Boolean => "BOOLEAN",
            FieldType::Datetime => "DATETIME",
        };
        f.write_str(s)
    }
}

impl fmt::Display for FieldMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FieldMode::Required => "REQUIRED",
            FieldMode::Nullable => "NULLABLE",
            FieldMode::Repeated => "REPEATED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaField {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    pub mode: FieldMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl SchemaField {
    pub fn new(name: &str, field_type: FieldType, mode: FieldMode, description: &str) -> Self {
        Self {
            name: name.to_string(),
            field_type,
            mode,
            description: Some(description.to_string()),
        }
    }

    fn nullable(name: &str, field_type: FieldType, description: &str) -> Self {
        Self::new(name, field_type, FieldMode::Nullable, description)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("column {column} cannot change type from {from} to {to}")]
    TypeChanged { column: String, from: FieldType, to: FieldType },
    #[error("column {column} cannot change mode from {from} to {to}")]
    ModeChanged { column: String, from: FieldMode, to: FieldMode },
    #[error("new column {column} must be NULLABLE or REPEATED, not REQUIRED")]
    RequiredColumnAdded { column: String },
    #[error("duplicate column {column}")]
    DuplicateColumn { column: String },
}

/// Ordered list of columns. Column order is the row serialization order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub fields: Vec<SchemaField>,
}

impl TableSchema {
    pub fn new(fields: Vec<SchemaField>) -> Result<Self, SchemaError> {
        let mut seen = std::collections::HashSet::new();
        for field in &fields {
            if !seen.insert(field.name.as_str()) {
                return Err(SchemaError::DuplicateColumn {
                    column: field.name.clone(),
                });
            }
        }
        Ok(Self { fields })
    }

    pub fn field(&self, name: &str) -> Option<&SchemaField> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    /// Merge an incoming load schema into this table schema.
    ///
    /// REQUIRED may relax to NULLABLE and new NULLABLE or REPEATED columns are
    /// appended. Type changes, tightening to REQUIRED, moving in or out of
    /// REPEATED, and new REQUIRED columns are rejected. Existing columns the
    /// incoming schema omits are kept and, since loads will leave them empty,
    /// relaxed to NULLABLE when they were REQUIRED.
    pub fn relax_with(&self, incoming: &TableSchema) -> Result<TableSchema, SchemaError> {
        let mut merged = Vec::with_capacity(self.fields.len().max(incoming.fields.len()));

        for current in &self.fields {
            let Some(next) = incoming.field(&current.name) else {
                let mut kept = current.clone();
                if kept.mode == FieldMode::Required {
                    kept.mode = FieldMode::Nullable;
                }
                merged.push(kept);
                continue;
            };
            if next.field_type != current.field_type {
                return Err(SchemaError::TypeChanged {
                    column: current.name.clone(),
                    from: current.field_type,
                    to: next.field_type,
                });
            }
            let mode = match (current.mode, next.mode) {
                (from, to) if from == to => from,
                (FieldMode::Required, FieldMode::Nullable) => FieldMode::Nullable,
                (from, to) => {
                    return Err(SchemaError::ModeChanged {
                        column: current.name.clone(),
                        from,
                        to,
                    })
                }
            };
            merged.push(SchemaField {
                mode,
                description: next.description.clone().or_else(|| current.description.clone()),
                ..current.clone()
            });
        }

        for next in &incoming.fields {
            if self.field(&next.name).is_some() {
                continue;
            }
            if next.mode == FieldMode::Required {
                return Err(SchemaError::RequiredColumnAdded {
                    column: next.name.clone(),
                });
            }
            merged.push(next.clone());
        }

        TableSchema::new(merged)
    }
}

/// Fixed raw-games schema per platform.
pub fn schema_for(platform: Platform) -> TableSchema {
    use FieldType::*;

    let (id_description, url_description) = match platform {
        Platform::ChessCom => ("uuid provided by chess.com", "game url on chess.com"),
        Platform::Lichess => ("id provided by lichess", "game url on lichess.org"),
    };
    let mut fields = vec![
        SchemaField::new("game_id", String, FieldMode::Required, id_description),
        SchemaField::nullable("url", String, url_description),
        SchemaField::nullable("time_class", String, "time class of the game"),
        SchemaField::nullable("time_control", String, "time control of the game"),
        SchemaField::nullable("is_rated", Boolean, "whether the game is rated or not"),
        SchemaField::nullable("white_rating", Integer, "white player's rating"),
        SchemaField::nullable("black_rating", Integer, "black player's rating"),
        SchemaField::nullable("white_accuracy", Float, "white player's accuracy"),
        SchemaField::nullable("black_accuracy", Float, "black player's accuracy"),
    ];
    match platform {
        Platform::ChessCom => fields.extend([
            SchemaField::nullable("white_result", String, "white player's result"),
            SchemaField::nullable("black_result", String, "black player's result"),
        ]),
        Platform::Lichess => fields.extend([
            SchemaField::nullable(
                "game_winner",
                String,
                "winner of the game. Can be 'white', 'black', or 'draw'",
            ),
            SchemaField::nullable(
                "game_status",
                String,
                "can be draw, mate, resign, outoftime, aborted, stalemate, timeout, cheat",
            ),
        ]),
    }
    fields.push(SchemaField::nullable("colour", String, "colour of the player"));
    fields.push(match platform {
        Platform::ChessCom => SchemaField::nullable("opponent_id", Integer, "opponent's ID"),
        Platform::Lichess => SchemaField::nullable("opponent_id", String, "opponent's id as provided by lichess"),
    });
    fields.extend([
        SchemaField::nullable("opponent_username", String, "opponent's username"),
        SchemaField::nullable("opponent_country", String, "opponent's country"),
        SchemaField::nullable("opponent_is_verified", Boolean, "whether the opponent is verified or not"),
        SchemaField::nullable("opponent_status", String, "opponent's status"),
        SchemaField::nullable("start_datetime", String, "start datetime of the game in UTC"),
        SchemaField::nullable("end_datetime", String, "end datetime of the game in UTC"),
        SchemaField::nullable("opening_code", String, "opening code of the game"),
        SchemaField::nullable("opening_name", String, "opening name of the game"),
        SchemaField::nullable("opening_url", String, "url for the opening"),
        SchemaField::nullable("total_moves", Integer, "total moves in the game"),
        SchemaField::new("moves", String, FieldMode::Repeated, "moves of the game"),
        SchemaField::new("move_times", String, FieldMode::Repeated, "move times of the game"),
        SchemaField::nullable("_extracted_at", Datetime, "datetime when the data was extracted"),
    ]);
    TableSchema { fields }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema(fields: &[(&str, FieldType, FieldMode)]) -> TableSchema {
        TableSchema::new(
            fields
                .iter()
                .map(|(n, t, m)| SchemaField::new(n, *t, *m, "d"))
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn platform_schemas_differ_only_in_results_and_opponent_id() {
        let chesscom = schema_for(Platform::ChessCom);
        let lichess = schema_for(Platform::Lichess);
        assert_eq!(chesscom.len(), 26);
        assert_eq!(lichess.len(), 26);
        assert_eq!(chesscom.fields[0].mode, FieldMode::Required);
        assert_eq!(chesscom.field("opponent_id").unwrap().field_type, FieldType::Integer);
        assert_eq!(lichess.field("opponent_id").unwrap().field_type, FieldType::String);
        assert!(chesscom.field("white_result").is_some());
        assert!(lichess.field("game_winner").is_some());
        assert_eq!(lichess.field("moves").unwrap().mode, FieldMode::Repeated);
        assert_eq!(lichess.fields.last().unwrap().name, "_extracted_at");
        assert!(chesscom.fields.iter().all(|f| f.description.is_some()));
    }

    #[test]
    fn relaxation_allows_required_to_nullable_and_nullable_additions() {
        use FieldMode::*;
        use FieldType::*;
        let table = schema(&[("id", String, Required), ("n", Integer, Nullable)]);
        let incoming = schema(&[
            ("id", String, Nullable),
            ("n", Integer, Nullable),
            ("tags", String, Repeated),
            ("extra", Float, Nullable),
        ]);
        let merged = table.relax_with(&incoming).unwrap();
        let names: Vec<_> = merged.column_names().collect();
        assert_eq!(names, vec!["id", "n", "tags", "extra"]);
        assert_eq!(merged.field("id").unwrap().mode, Nullable);

        let narrower = schema(&[("n", Integer, Nullable)]);
        let merged = table.relax_with(&narrower).unwrap();
        assert_eq!(merged.len(), 2);
        assert_eq!(merged.field("id").unwrap().mode, Nullable);
    }

    #[test]
    fn relaxation_rejects_tightening_and_type_changes() {
        use FieldMode::*;
        use FieldType::*;
        let table = schema(&[("id", String, Nullable), ("tags", String, Repeated)]);

        let err = table.relax_with(&schema(&[("id", Integer, Nullable)])).unwrap_err();
        assert!(matches!(err, SchemaError::TypeChanged { .. }));

        let err = table.relax_with(&schema(&[("id", String, Required)])).unwrap_err();
        assert!(matches!(err, SchemaError::ModeChanged { from: Nullable, to: Required, .. }));

        let err = table.relax_with(&schema(&[("tags", String, Nullable)])).unwrap_err();
        assert!(matches!(err, SchemaError::ModeChanged { from: Repeated, .. }));

        let err = table.relax_with(&schema(&[("new_one", String, Required)])).unwrap_err();
        assert_eq!(
            err,
            SchemaError::RequiredColumnAdded {
                column: "new_one".into()
            }
        );
    }

    #[test]
    fn schema_serializes_like_bigquery() {
        let json = serde_json::to_value(schema_for(Platform::Lichess)).unwrap();
        assert_eq!(json["fields"][0]["name"], "game_id");
        assert_eq!(json["fields"][0]["type"], "STRING");
        assert_eq!(json["fields"][0]["mode"], "REQUIRED");
        assert_eq!(
            TableSchema::new(vec![
                SchemaField::new("a", FieldType::String, FieldMode::Nullable, "x"),
                SchemaField::new("a", FieldType::String, FieldMode::Nullable, "x"),
            ])
            .unwrap_err(),
            SchemaError::DuplicateColumn { column: "a".into() }
        );
    }
}
