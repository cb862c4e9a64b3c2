use std::fmt;

use serde::Serialize;

/// Where an operation was invoked from. Purely diagnostic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct Site {
    pub line: u32,
    pub file: &'static str,
}

impl Site {
    pub const fn new(line: u32, file: &'static str) -> Self {
        Self { line, file }
    }
}

impl fmt::Display for Site {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "file {} at line {}", self.file, self.line)
    }
}

/// Capture the current call site as a [`Site`].
#[macro_export]
macro_rules! site {
    () => {
        $crate::Site::new(::core::line!(), ::core::file!())
    };
}

#[cfg(test)]
mod tests {
    #[test]
    fn site_macro_captures_this_file() {
        let site = crate::site!();
        assert!(site.file.ends_with("site.rs"));
        assert_eq!(site.to_string(), format!("file {} at line {}", site.file, site.line));
    }
}
