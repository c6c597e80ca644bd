//! Face-record source files
//!
//! A source is a JSON document of the form `{"faces": [FaceRecord, ...]}`
//! produced by the external font database builder. Unknown fields are
//! ignored so newer builders can add metadata.

use crate::index::types::FaceRecord;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Deserialize)]
struct FaceDatabase {
    #[serde(default)]
    faces: Vec<FaceRecord>,
}

/// Read all face records from one source file
pub fn load_face_records(path: &Path) -> Result<Vec<FaceRecord>> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open face database {}", path.display()))?;
    let db: FaceDatabase = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("Failed to parse face database {}", path.display()))?;

    let mut faces = db.faces;
    for face in &mut faces {
        face.dedup_names();
    }

    debug!("read {} faces from {}", faces.len(), path.display());
    Ok(faces)
}

/// Read and concatenate several sources; any failure aborts the whole load
pub fn load_all(paths: &[PathBuf]) -> Result<Vec<FaceRecord>> {
    let mut faces = Vec::new();
    for path in paths {
        faces.extend(load_face_records(path)?);
    }
    Ok(faces)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::types::NameClass;
    use std::fs;

    #[test]
    fn test_load_face_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fonts.json");
        fs::write(
            &path,
            r#"{
                "builder": "ignored",
                "faces": [
                    {
                        "path": "C:\\F\\a.ttf",
                        "face_index": 0,
                        "names": [
                            {"class": "Family", "name": "Arial"},
                            {"class": "Family", "name": "Arial"},
                            {"class": "FullName", "name": "Arial Regular"}
                        ],
                        "weight": 400,
                        "oblique": false,
                        "ps_outline": false,
                        "file_hash": "ignored"
                    },
                    {"path": "C:\\F\\b.otf", "ps_outline": true}
                ]
            }"#,
        )
        .unwrap();

        let faces = load_face_records(&path).unwrap();
        assert_eq!(faces.len(), 2);
        assert_eq!(faces[0].names_of(NameClass::Family).count(), 1);
        assert_eq!(faces[0].names_of(NameClass::FullName).next(), Some("Arial Regular"));
        assert_eq!(faces[1].weight, 400);
        assert!(faces[1].ps_outline);
        assert!(faces[1].names.is_empty());
    }

    #[test]
    fn test_load_all_fails_on_any_bad_source() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.json");
        let bad = dir.path().join("bad.json");
        fs::write(&good, r#"{"faces": [{"path": "a.ttf"}]}"#).unwrap();
        fs::write(&bad, r#"{"faces": [{"face_index": 3}]}"#).unwrap();

        assert_eq!(load_all(std::slice::from_ref(&good)).unwrap().len(), 1);
        assert!(load_all(&[good.clone(), bad]).is_err());
        assert!(load_all(&[good, dir.path().join("missing.json")]).is_err());
    }
}
