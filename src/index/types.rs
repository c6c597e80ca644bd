use serde::{Deserialize, Serialize};

/// Handle of a face inside one generation's face store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FaceId(pub u32);

impl FaceId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Naming convention a face name belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NameClass {
    /// Win32 (GDI) family name, e.g. "Arial"
    Family,
    /// Full face name, e.g. "Arial Bold Italic"
    FullName,
    /// PostScript name, e.g. "Arial-BoldItalicMT"
    PostScriptName,
}

impl NameClass {
    pub const ALL: [NameClass; 3] = [NameClass::Family, NameClass::FullName, NameClass::PostScriptName];
}

/// One name of a face
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FaceName {
    pub class: NameClass,
    pub name: String,
}

impl FaceName {
    pub fn new(class: NameClass, name: impl Into<String>) -> Self {
        Self {
            class,
            name: name.into(),
        }
    }
}

/// A single selectable font face, as produced by the face-record loader
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceRecord {
    /// Path of the font file
    pub path: String,
    /// Ordinal of the face within a collection file
    #[serde(default)]
    pub face_index: u32,
    #[serde(default)]
    pub names: Vec<FaceName>,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub oblique: bool,
    /// Face has PostScript (CFF) outlines rather than TrueType outlines
    #[serde(default)]
    pub ps_outline: bool,
}

fn default_weight() -> u32 {
    400
}

impl FaceRecord {
    pub fn new(path: impl Into<String>, face_index: u32) -> Self {
        Self {
            path: path.into(),
            face_index,
            names: Vec::new(),
            weight: default_weight(),
            oblique: false,
            ps_outline: false,
        }
    }

    /// Builder-style helper used by loaders and tests
    pub fn with_name(mut self, class: NameClass, name: impl Into<String>) -> Self {
        self.names.push(FaceName::new(class, name));
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_oblique(mut self, oblique: bool) -> Self {
        self.oblique = oblique;
        self
    }

    pub fn with_ps_outline(mut self, ps_outline: bool) -> Self {
        self.ps_outline = ps_outline;
        self
    }

    /// Names of one class, in stored order
    pub fn names_of(&self, class: NameClass) -> impl Iterator<Item = &str> {
        self.names
            .iter()
            .filter(move |n| n.class == class)
            .map(|n| n.name.as_str())
    }

    /// Sort and drop repeated (class, name) pairs
    pub fn dedup_names(&mut self) {
        self.names.sort();
        self.names.dedup();
    }

    /// Identity of the face within a generation
    pub fn key(&self) -> (&str, u32) {
        (&self.path, self.face_index)
    }

    pub fn to_descriptor(&self) -> FaceDescriptor {
        FaceDescriptor {
            path: self.path.clone(),
            face_index: self.face_index,
            weight: self.weight,
            oblique: self.oblique,
            ps_outline: self.ps_outline,
            family_names: self.names_of(NameClass::Family).map(str::to_owned).collect(),
            full_names: self.names_of(NameClass::FullName).map(str::to_owned).collect(),
            postscript_names: self
                .names_of(NameClass::PostScriptName)
                .map(str::to_owned)
                .collect(),
        }
    }
}

/// Resolved face as returned to clients
///
/// Carries every name of the face so the caller can tell whether the font is
/// already resident before loading the file again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceDescriptor {
    pub path: String,
    #[serde(default)]
    pub face_index: u32,
    #[serde(default)]
    pub weight: u32,
    #[serde(default)]
    pub oblique: bool,
    #[serde(default)]
    pub ps_outline: bool,
    #[serde(default)]
    pub family_names: Vec<String>,
    #[serde(default)]
    pub full_names: Vec<String>,
    #[serde(default)]
    pub postscript_names: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_groups_names_by_class() {
        let face = FaceRecord::new("C:\\F\\a.ttf", 0)
            .with_name(NameClass::Family, "Arial")
            .with_name(NameClass::FullName, "Arial Regular")
            .with_name(NameClass::PostScriptName, "ArialMT")
            .with_name(NameClass::Family, "Arial Local");

        let desc = face.to_descriptor();
        assert_eq!(desc.family_names, vec!["Arial", "Arial Local"]);
        assert_eq!(desc.full_names, vec!["Arial Regular"]);
        assert_eq!(desc.postscript_names, vec!["ArialMT"]);
        assert_eq!(desc.weight, 400);
    }

    #[test]
    fn test_dedup_names_is_case_sensitive() {
        let mut face = FaceRecord::new("a.ttf", 0)
            .with_name(NameClass::Family, "Arial")
            .with_name(NameClass::Family, "Arial")
            .with_name(NameClass::Family, "ARIAL")
            .with_name(NameClass::FullName, "Arial");
        face.dedup_names();
        assert_eq!(face.names.len(), 3);
    }
}
