//! SQLite-backed artifact store on the shared [`Database`] handle.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use super::ArtifactStore;
use crate::db::Database;
use crate::errors::{DatabaseError, StorageError};
use crate::models::{Artifact, ArtifactKind, Directory, Snippet};

impl ArtifactStore for Database {
    fn list(&self, kind: ArtifactKind) -> Result<Vec<Artifact>, StorageError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT full_path, kind, name, body, language, file_name, sort_order, created_at
                 FROM artifacts WHERE kind = ?1 ORDER BY full_path",
            )
            .map_err(DatabaseError::from)?;
        let rows = stmt
            .query_map(params![kind.to_string()], read_row)
            .map_err(DatabaseError::from)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(DatabaseError::from)?;
        rows.into_iter()
            .map(|row| row.into_artifact().map_err(StorageError::from))
            .collect()
    }

    fn save_snippet(&self, snippet: &Snippet) -> Result<(), StorageError> {
        let inserted = self.transaction(|conn| {
            if exists(conn, &snippet.full_path, None)? {
                return Ok(false);
            }
            conn.execute(
                "INSERT INTO artifacts (full_path, kind, name, body, language, file_name, sort_order, created_at)
                 VALUES (?1, 'snippet', ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    snippet.full_path,
                    snippet.name,
                    snippet.body,
                    snippet.language,
                    snippet.file_name,
                    snippet.order,
                    snippet.created_at.to_rfc3339(),
                ],
            )?;
            Ok(true)
        })?;
        if !inserted {
            return Err(StorageError::AlreadyExists(snippet.full_path.clone()));
        }
        debug!(path = %snippet.full_path, "snippet saved");
        Ok(())
    }

    fn update_snippet(&self, snippet: &Snippet) -> Result<(), StorageError> {
        let conn = self.conn();
        let changed = conn
            .execute(
                "UPDATE artifacts SET name = ?2, body = ?3, language = ?4, file_name = ?5, sort_order = ?6, created_at = ?7
                 WHERE full_path = ?1 AND kind = 'snippet'",
                params![
                    snippet.full_path,
                    snippet.name,
                    snippet.body,
                    snippet.language,
                    snippet.file_name,
                    snippet.order,
                    snippet.created_at.to_rfc3339(),
                ],
            )
            .map_err(DatabaseError::from)?;
        if changed == 0 {
            return Err(StorageError::NotFound(snippet.full_path.clone()));
        }
        Ok(())
    }

    fn delete_snippet(&self, full_path: &str) -> Result<(), StorageError> {
        delete_kind(self, full_path, ArtifactKind::Snippet)
    }

    fn create_directory(&self, directory: &Directory) -> Result<(), StorageError> {
        let inserted = self.transaction(|conn| {
            if exists(conn, &directory.full_path, None)? {
                return Ok(false);
            }
            conn.execute(
                "INSERT INTO artifacts (full_path, kind, name, sort_order) VALUES (?1, 'directory', ?2, ?3)",
                params![directory.full_path, directory.name, directory.order],
            )?;
            Ok(true)
        })?;
        if !inserted {
            return Err(StorageError::AlreadyExists(directory.full_path.clone()));
        }
        debug!(path = %directory.full_path, "directory created");
        Ok(())
    }

    fn delete_directory(&self, full_path: &str) -> Result<(), StorageError> {
        delete_kind(self, full_path, ArtifactKind::Directory)
    }
}

struct ArtifactRow {
    full_path: String,
    kind: String,
    name: String,
    body: Option<String>,
    language: Option<String>,
    file_name: Option<String>,
    order: i64,
    created_at: Option<String>,
}

impl ArtifactRow {
    fn into_artifact(self) -> Result<Artifact, DatabaseError> {
        match self.kind.as_str() {
            "directory" => Ok(Directory {
                full_path: self.full_path,
                name: self.name,
                order: self.order,
            }
            .into()),
            "snippet" => {
                let created_at = match self.created_at.as_deref() {
                    Some(raw) => DateTime::parse_from_rfc3339(raw)
                        .map(|t| t.with_timezone(&Utc))
                        .map_err(|e| DatabaseError::Corrupt {
                            entity: "artifact".into(),
                            detail: format!("{}: bad created_at: {e}", self.full_path),
                        })?,
                    None => Utc::now(),
                };
                Ok(Snippet {
                    full_path: self.full_path,
                    name: self.name,
                    body: self.body.unwrap_or_default(),
                    language: self.language.unwrap_or_default(),
                    file_name: self.file_name,
                    order: self.order,
                    created_at,
                }
                .into())
            }
            other => Err(DatabaseError::Corrupt {
                entity: "artifact".into(),
                detail: format!("{}: unknown kind '{other}'", self.full_path),
            }),
        }
    }
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<ArtifactRow> {
    Ok(ArtifactRow {
        full_path: row.get(0)?,
        kind: row.get(1)?,
        name: row.get(2)?,
        body: row.get(3)?,
        language: row.get(4)?,
        file_name: row.get(5)?,
        order: row.get(6)?,
        created_at: row.get(7)?,
    })
}

fn exists(conn: &Connection, full_path: &str, kind: Option<ArtifactKind>) -> Result<bool, DatabaseError> {
    let found: Option<String> = conn
        .query_row(
            "SELECT kind FROM artifacts WHERE full_path = ?1",
            params![full_path],
            |row| row.get(0),
        )
        .optional()?;
    Ok(match (found, kind) {
        (Some(found), Some(kind)) => found == kind.to_string(),
        (found, None) => found.is_some(),
        (None, Some(_)) => false,
    })
}

fn delete_kind(db: &Database, full_path: &str, kind: ArtifactKind) -> Result<(), StorageError> {
    let deleted = db.transaction(|conn| {
        if !exists(conn, full_path, Some(kind))? {
            return Ok(false);
        }
        conn.execute("DELETE FROM artifacts WHERE full_path = ?1", params![full_path])?;
        Ok(true)
    })?;
    if !deleted {
        return Err(StorageError::NotFound(full_path.to_string()));
    }
    debug!(path = full_path, %kind, "artifact deleted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::snapshot;

    fn setup_db() -> Database {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        db
    }

    #[test]
    fn test_snippet_round_trip() {
        let db = setup_db();
        let mut s = Snippet::new("/work/hello", "fn main() {}\n", "rust");
        s.file_name = Some("main.rs".into());
        s.order = 3;
        db.save_snippet(&s).unwrap();

        let listed = db.list(ArtifactKind::Snippet).unwrap();
        assert_eq!(listed, vec![Artifact::from(s.clone())]);

        assert!(matches!(db.save_snippet(&s), Err(StorageError::AlreadyExists(_))));
    }

    #[test]
    fn test_update_and_delete() {
        let db = setup_db();
        let mut s = Snippet::new("/a", "one", "text");
        assert!(matches!(db.update_snippet(&s), Err(StorageError::NotFound(_))));

        db.save_snippet(&s).unwrap();
        s.body = "two".into();
        db.update_snippet(&s).unwrap();
        assert_eq!(db.list(ArtifactKind::Snippet).unwrap()[0].body(), Some("two"));

        db.delete_snippet("/a").unwrap();
        assert!(matches!(db.delete_snippet("/a"), Err(StorageError::NotFound(_))));
    }

    #[test]
    fn test_directories() {
        let db = setup_db();
        db.create_directory(&Directory::new("/work")).unwrap();
        db.save_snippet(&Snippet::new("/work/a", "x", "text")).unwrap();
        assert!(matches!(
            db.create_directory(&Directory::new("/work")),
            Err(StorageError::AlreadyExists(_))
        ));
        assert!(matches!(db.delete_snippet("/work"), Err(StorageError::NotFound(_))));

        assert_eq!(snapshot(&db).unwrap().len(), 2);
        db.delete_directory("/work").unwrap();
        assert_eq!(snapshot(&db).unwrap().len(), 1);
    }
}
