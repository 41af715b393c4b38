pub mod pdf;

use std::path::{Path, PathBuf};

use crate::error::RenderError;
use crate::registry::{CardTemplate, Driver};

pub use pdf::{CardLayout, PdfCardRenderer};

/// Turns one driver plus one template into one card file.
pub trait CardRenderer: Send + Sync {
    /// Writes the card into `destination` and returns its path.
    fn render(
        &self,
        driver: &Driver,
        template: &CardTemplate,
        destination: &Path,
    ) -> Result<PathBuf, RenderError>;
}
