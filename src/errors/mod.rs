use thiserror::Error;

/// Typed error kinds for the control plane.
///
/// Use at module boundaries (storage, broker, dispatcher, runtime, gateway handlers).
/// Leaf call sites (HTTP clients, filesystem I/O) keep using `anyhow::Result`; the
/// `Internal` variant lets them flow through `?` without manual wrapping.
#[derive(Debug, Error)]
pub enum MethingsError {
    // --- access ---
    #[error("permission_required")]
    PermissionRequired,
    #[error("permission_not_approved")]
    PermissionNotApproved,
    #[error("permission_expired")]
    PermissionExpired,
    #[error("invalid_permission")]
    InvalidPermission,

    // --- scope ---
    #[error("command_not_allowed")]
    CommandNotAllowed,
    #[error("path_outside_user_dir")]
    PathOutsideUserDir,
    #[error("path_not_allowed")]
    PathNotAllowed,
    #[error("invalid_path")]
    InvalidPath,

    // --- input ---
    #[error("missing_text")]
    MissingText,
    #[error("missing_name")]
    MissingName,
    #[error("missing_code")]
    MissingCode,
    #[error("missing_value")]
    MissingValue,
    #[error("invalid_json")]
    InvalidJson,
    #[error("invalid_payload")]
    InvalidPayload,
    #[error("unknown_action")]
    UnknownAction,
    #[error("unknown_tool")]
    UnknownTool,
    #[error("unsupported_action")]
    UnsupportedAction,
    #[error("unsupported_fs_op")]
    UnsupportedFsOp,

    // --- peer ---
    #[error("upstream_error: {0}")]
    UpstreamError(String),
    #[error("http_error: {0}")]
    HttpError(String),
    #[error("usb_permission_required")]
    UsbPermissionRequired,
    #[error("vault_decrypt_failed")]
    VaultDecryptFailed,

    // --- config/internal ---
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl MethingsError {
    /// The wire-level error kind string used in `{status: error, error: <kind>}` bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PermissionRequired => "permission_required",
            Self::PermissionNotApproved => "permission_not_approved",
            Self::PermissionExpired => "permission_expired",
            Self::InvalidPermission => "invalid_permission",
            Self::CommandNotAllowed => "command_not_allowed",
            Self::PathOutsideUserDir => "path_outside_user_dir",
            Self::PathNotAllowed => "path_not_allowed",
            Self::InvalidPath => "invalid_path",
            Self::MissingText => "missing_text",
            Self::MissingName => "missing_name",
            Self::MissingCode => "missing_code",
            Self::MissingValue => "missing_value",
            Self::InvalidJson => "invalid_json",
            Self::InvalidPayload => "invalid_payload",
            Self::UnknownAction => "unknown_action",
            Self::UnknownTool => "unknown_tool",
            Self::UnsupportedAction => "unsupported_action",
            Self::UnsupportedFsOp => "unsupported_fs_op",
            Self::UpstreamError(_) => "upstream_error",
            Self::HttpError(_) => "http_error",
            Self::UsbPermissionRequired => "usb_permission_required",
            Self::VaultDecryptFailed => "vault_decrypt_failed",
            Self::Config(_) => "config_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// HTTP status this error kind maps to at the gateway edge (spec §7).
    pub fn status_code(&self) -> u16 {
        match self {
            Self::PermissionRequired | Self::PermissionExpired => 403,
            Self::UnknownAction | Self::UnknownTool | Self::InvalidPermission => 404,
            Self::MissingText
            | Self::MissingName
            | Self::MissingCode
            | Self::MissingValue
            | Self::InvalidJson
            | Self::InvalidPayload
            | Self::UnsupportedAction
            | Self::UnsupportedFsOp
            | Self::CommandNotAllowed
            | Self::PathOutsideUserDir
            | Self::PathNotAllowed
            | Self::InvalidPath
            | Self::PermissionNotApproved => 400,
            _ => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, MethingsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_strings_match_spec_vocabulary() {
        assert_eq!(MethingsError::PermissionRequired.kind(), "permission_required");
        assert_eq!(MethingsError::PathOutsideUserDir.kind(), "path_outside_user_dir");
        assert_eq!(MethingsError::UnsupportedFsOp.kind(), "unsupported_fs_op");
    }

    #[test]
    fn status_mapping_follows_error_handling_design() {
        assert_eq!(MethingsError::PermissionRequired.status_code(), 403);
        assert_eq!(MethingsError::UnknownTool.status_code(), 404);
        assert_eq!(MethingsError::InvalidPath.status_code(), 400);
        assert_eq!(MethingsError::Config("x".into()).status_code(), 500);
    }
}
