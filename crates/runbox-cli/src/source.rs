//! Code to run, read from a file or a shared snippet.

use std::path::Path;

use anyhow::{Context, Result, anyhow};
use runbox_core::{Editor, Language};
use runbox_executor::Snippet;

/// Fixed buffer standing in for an editor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceBuffer {
    code: String,
    language: Language,
}

impl SourceBuffer {
    pub const fn new(code: String, language: Language) -> Self {
        Self { code, language }
    }

    /// Read `path`. The language comes from `language`, or else the file
    /// extension.
    pub fn from_file(path: &Path, language: Option<Language>) -> Result<Self> {
        let language = match language {
            Some(language) => language,
            None => infer_language(path)?,
        };
        let code = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Ok(Self::new(code, language))
    }

    pub fn from_snippet(snippet: Snippet, language: Option<Language>) -> Self {
        Self::new(snippet.code.unwrap_or_default(), language.unwrap_or(snippet.language))
    }
}

impl Editor for SourceBuffer {
    fn current_code(&self) -> String {
        self.code.clone()
    }

    fn selected_language(&self) -> Language {
        self.language
    }
}

fn infer_language(path: &Path) -> Result<Language> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .and_then(Language::from_extension)
        .ok_or_else(|| {
            anyhow!(
                "Cannot tell the language of {}, pass --language",
                path.display()
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infer_language() {
        assert_eq!(infer_language(Path::new("a/main.py")).unwrap(), Language::Python);
        assert_eq!(infer_language(Path::new("index.js")).unwrap(), Language::Javascript);
        assert!(infer_language(Path::new("Makefile")).is_err());
    }

    #[test]
    fn test_from_file() {
        let path = std::env::temp_dir().join(format!("runbox-source-{}.txt", std::process::id()));
        std::fs::write(&path, "print(1)\n").unwrap();

        assert!(SourceBuffer::from_file(&path, None).is_err());
        let buffer = SourceBuffer::from_file(&path, Some(Language::Python)).unwrap();
        assert_eq!(buffer.current_code(), "print(1)\n");
        assert_eq!(buffer.selected_language(), Language::Python);

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_missing_file() {
        let err = SourceBuffer::from_file(Path::new("/nonexistent/x.py"), None).unwrap_err();
        assert!(err.to_string().starts_with("Failed to read"));
    }
}
