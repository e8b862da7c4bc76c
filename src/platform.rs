//! Web application platform detection
//!
//! A directory is an application root when one of a platform's sentinel
//! paths exists under it. Only Magento 2 carries exclude globs; the
//! other platforms have no custom behavior.

use std::path::Path;

use globset::{Glob, GlobSet, GlobSetBuilder};

/// A supported web application platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Magento2,
    Magento1,
    WordPress,
}

impl Platform {
    pub fn name(&self) -> &'static str {
        match self {
            Platform::Magento2 => "magento2",
            Platform::Magento1 => "magento1",
            Platform::WordPress => "wordpress",
        }
    }

    /// Relative paths whose presence identifies this platform.
    fn sentinel_paths(&self) -> &'static [&'static str] {
        match self {
            Platform::Magento2 => &[
                "app/etc/env.php",
                "lib/internal/Magento",
                "app/design/frontend/Magento",
            ],
            Platform::Magento1 => &["app/etc/local.xml"],
            Platform::WordPress => &["wp-config.php"],
        }
    }

    /// Glob patterns for paths to skip during scanning.
    fn exclude_patterns(&self) -> &'static [&'static str] {
        match self {
            Platform::Magento2 => &["var/**", "vendor/composer/autoload_*.php"],
            _ => &[],
        }
    }

    /// Compiled exclude matcher for relative paths.
    pub fn exclude_set(&self) -> GlobSet {
        let mut builder = GlobSetBuilder::new();
        for pat in self.exclude_patterns() {
            builder.add(Glob::new(pat).expect("static glob pattern"));
        }
        builder.build().expect("static glob set")
    }
}

// Ordered by detection priority, most specific first.
const PLATFORMS: &[Platform] = &[Platform::Magento2, Platform::Magento1, Platform::WordPress];

/// Identify the platform at `root` by checking sentinel paths. Returns
/// None when no known platform is present.
pub fn detect(root: &Path) -> Option<Platform> {
    for p in PLATFORMS {
        for sentinel in p.sentinel_paths() {
            if root.join(sentinel).exists() {
                return Some(*p);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_detect_magento2() {
        let dir = tempfile::TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("app/etc")).unwrap();
        fs::write(dir.path().join("app/etc/env.php"), "<?php return [];").unwrap();
        assert_eq!(detect(dir.path()), Some(Platform::Magento2));
    }

    #[test]
    fn test_detect_magento1() {
        let dir = tempfile::TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("app/etc")).unwrap();
        fs::write(dir.path().join("app/etc/local.xml"), "<config/>").unwrap();
        assert_eq!(detect(dir.path()), Some(Platform::Magento1));
    }

    #[test]
    fn test_detect_wordpress() {
        let dir = tempfile::TempDir::new().unwrap();
        fs::write(dir.path().join("wp-config.php"), "<?php").unwrap();
        assert_eq!(detect(dir.path()), Some(Platform::WordPress));
    }

    #[test]
    fn test_detect_nothing() {
        let dir = tempfile::TempDir::new().unwrap();
        fs::write(dir.path().join("index.html"), "hi").unwrap();
        assert_eq!(detect(dir.path()), None);
    }

    #[test]
    fn test_magento2_takes_priority_over_wordpress() {
        let dir = tempfile::TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("app/etc")).unwrap();
        fs::write(dir.path().join("app/etc/env.php"), "<?php").unwrap();
        fs::write(dir.path().join("wp-config.php"), "<?php").unwrap();
        assert_eq!(detect(dir.path()), Some(Platform::Magento2));
    }

    #[test]
    fn test_magento2_excludes() {
        let set = Platform::Magento2.exclude_set();
        assert!(set.is_match("var/cache/mage-tags/foo"));
        assert!(set.is_match("vendor/composer/autoload_real.php"));
        assert!(!set.is_match("vendor/magento/module-catalog/Block/Product.php"));
        assert!(!set.is_match("app/etc/env.php"));
    }

    #[test]
    fn test_other_platforms_have_no_excludes() {
        assert!(!Platform::Magento1.exclude_set().is_match("var/cache/x"));
        assert!(!Platform::WordPress.exclude_set().is_match("wp-content/uploads/x"));
    }
}
