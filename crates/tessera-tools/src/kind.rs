use tessera_core::error::{Result, TesseraError};

/// The closed set of tools a node may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolKind {
    CollectUserInput,
    ResolveOutput,
    CreateFile,
    ReadFile,
    FetchUrl,
    ExtractUrlText,
}

impl ToolKind {
    pub const ALL: [ToolKind; 6] = [
        ToolKind::CollectUserInput,
        ToolKind::ResolveOutput,
        ToolKind::CreateFile,
        ToolKind::ReadFile,
        ToolKind::FetchUrl,
        ToolKind::ExtractUrlText,
    ];

    pub fn parse(name: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.name() == name)
            .ok_or_else(|| TesseraError::ToolNotFound(name.to_string()))
    }

    /// Name used in model tool calls.
    pub fn name(&self) -> &'static str {
        match self {
            ToolKind::CollectUserInput => "collectUserInput",
            ToolKind::ResolveOutput => "resolveOutput",
            ToolKind::CreateFile => "createFile",
            ToolKind::ReadFile => "readFile",
            ToolKind::FetchUrl => "fetchUrl",
            ToolKind::ExtractUrlText => "extractUrlText",
        }
    }

    /// Handled by the node executor rather than the registry.
    pub fn is_intrinsic(&self) -> bool {
        matches!(self, ToolKind::CollectUserInput | ToolKind::ResolveOutput)
    }
}

impl std::fmt::Display for ToolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_names() {
        for kind in ToolKind::ALL {
            assert_eq!(ToolKind::parse(kind.name()).unwrap(), kind);
        }
    }

    #[test]
    fn test_parse_unknown_name() {
        assert!(matches!(
            ToolKind::parse("generateImage"),
            Err(TesseraError::ToolNotFound(name)) if name == "generateImage"
        ));
    }

    #[test]
    fn test_intrinsic() {
        assert!(ToolKind::ResolveOutput.is_intrinsic());
        assert!(ToolKind::CollectUserInput.is_intrinsic());
        assert!(!ToolKind::ReadFile.is_intrinsic());
    }
}
