use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;

/// Ensure directory exists
pub fn ensure_dir<P: AsRef<Path>>(path: P) -> Result<()> {
    let path = path.as_ref();
    if !path.exists() {
        std::fs::create_dir_all(path)
            .with_context(|| format!("Failed to create directory: {:?}", path))?;
    }
    Ok(())
}

/// Format duration as human-readable string
pub fn format_duration(secs: f64) -> String {
    if secs < 60.0 {
        format!("{:.1}s", secs)
    } else if secs < 3600.0 {
        format!("{:.1}m", secs / 60.0)
    } else {
        format!("{:.1}h", secs / 3600.0)
    }
}

/// Progress bar over seeds; hidden when `visible` is false
pub fn progress_bar(len: u64, label: &str, visible: bool) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(len);
    let style =
        ProgressStyle::with_template("{msg:>24} [{bar:40.cyan/blue}] {pos}/{len} seeds ({eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar());
    pb.set_style(style.progress_chars("=> "));
    pb.set_message(label.to_string());
    pb
}

/// Random number utilities
pub mod random {
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    /// Create RNG with fixed seed
    pub fn seeded_rng(seed: u64) -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(seed)
    }
}

/// Validation of CLI inputs
pub mod validation {
    use anyhow::{bail, Result};

    /// Validate that a path exists
    pub fn exists<P: AsRef<std::path::Path>>(path: P, name: &str) -> Result<()> {
        let path = path.as_ref();
        if !path.exists() {
            bail!("{} not found: {:?}", name, path);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(30.0), "30.0s");
        assert_eq!(format_duration(90.0), "1.5m");
        assert_eq!(format_duration(3600.0), "1.0h");
    }

    #[test]
    fn test_seeded_rng() {
        let a: Vec<u32> = (0..5).map(|_| random::seeded_rng(42).gen()).collect();
        let mut rng = random::seeded_rng(42);
        let first: u32 = rng.gen();
        assert_eq!(a[0], first);
        assert!(a.iter().all(|&v| v == first));
    }

    #[test]
    fn test_validation() {
        assert!(validation::exists("/definitely/not/here", "input").is_err());
    }

    #[test]
    fn test_hidden_progress_bar() {
        let pb = progress_bar(3, "sages-gridsk", false);
        pb.inc(1);
        assert!(pb.is_hidden());
    }

    #[test]
    fn test_ensure_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        let nested = dir.path().join("a/b");
        ensure_dir(&nested).unwrap();
        assert!(nested.is_dir());
    }
}
