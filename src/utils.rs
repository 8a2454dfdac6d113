//! Small helpers shared by git plumbing and command templates

use std::path::Path;

/// Convert a path to Git format (always forward slashes)
///
/// Git expects paths with forward slashes, even on Windows.
pub fn path_to_git_format(path: &Path) -> String {
  #[cfg(target_os = "windows")]
  {
    path.to_string_lossy().replace('\\', "/")
  }
  #[cfg(not(target_os = "windows"))]
  {
    path.to_string_lossy().to_string()
  }
}

/// Substitute `{key}` placeholders in a single template argument
///
/// Unknown placeholders are left untouched so typos stay visible in logs.
pub fn render_template(template: &str, vars: &[(&str, &str)]) -> String {
  let mut rendered = template.to_string();
  for (key, value) in vars {
    rendered = rendered.replace(&format!("{{{}}}", key), value);
  }
  rendered
}
