use serde::Serialize;

/// The logical purpose of a cache partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Purpose {
  Static,
  Dynamic,
  Image,
}

/// Names of the partitions that are current for one cache version.
///
/// Names are `<purpose>-cache-<version>`. Bumping the version on a breaking
/// change orphans the old partitions, which activation then deletes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionNames {
  static_name: String,
  dynamic_name: String,
  image_name: String,
}

impl PartitionNames {
  pub fn for_version(version: &str) -> Self {
    Self {
      static_name: format!("static-cache-{}", version),
      dynamic_name: format!("dynamic-cache-{}", version),
      image_name: format!("image-cache-{}", version),
    }
  }

  pub fn name(&self, purpose: Purpose) -> &str {
    match purpose {
      Purpose::Static => &self.static_name,
      Purpose::Dynamic => &self.dynamic_name,
      Purpose::Image => &self.image_name,
    }
  }

  pub fn all(&self) -> [&str; 3] {
    [&self.static_name, &self.dynamic_name, &self.image_name]
  }

  pub fn contains(&self, name: &str) -> bool {
    self.all().contains(&name)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_names_follow_version() {
    let names = PartitionNames::for_version("v1");
    assert_eq!(names.name(Purpose::Static), "static-cache-v1");
    assert_eq!(names.name(Purpose::Dynamic), "dynamic-cache-v1");
    assert_eq!(names.name(Purpose::Image), "image-cache-v1");
  }

  #[test]
  fn test_old_version_is_not_current() {
    let names = PartitionNames::for_version("v2");
    assert!(names.contains("static-cache-v2"));
    assert!(!names.contains("static-cache-v1"));
  }
}
