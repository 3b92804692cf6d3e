//! The CheckFileInfo response of a WOPI host.

use serde_json::{Map, Value};
use tracing::{debug, error};

use crate::anonymize::{filename_from_url, Anonymizer};
use crate::file_info::FileInfo;

/// Extensions of template documents. Exporting a template is disabled.
const TEMPLATE_EXTENSIONS: &[&str] = &[
    ".stw", ".ott", ".dot", ".dotx", ".dotm", ".otm", ".stc", ".ots", ".xltx", ".xltm", ".sti",
    ".otp", ".potx", ".potm", ".std", ".otg",
];

/// Whether `filename` names a template document.
pub fn is_template(filename: &str) -> bool {
    let lower = filename.to_ascii_lowercase();
    TEMPLATE_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

/// A boolean the host may leave unspecified.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TriState {
    False,
    True,
    #[default]
    Unset,
}

impl From<bool> for TriState {
    fn from(value: bool) -> Self {
        if value {
            TriState::True
        } else {
            TriState::False
        }
    }
}

fn find_string(object: &Map<String, Value>, key: &str) -> Option<String> {
    match object.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn find_bool(object: &Map<String, Value>, key: &str) -> Option<bool> {
    match object.get(key)? {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|v| v != 0.0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn find_u64(object: &Map<String, Value>, key: &str) -> Option<u64> {
    match object.get(key)? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// The basic [`FileInfo`] carried by a CheckFileInfo response.
pub fn file_info_from_json(object: &Map<String, Value>) -> FileInfo {
    FileInfo::new(
        find_string(object, "BaseFileName").unwrap_or_default(),
        find_string(object, "OwnerId").unwrap_or_default(),
        find_string(object, "LastModifiedTime").unwrap_or_default(),
    )
}

/// Permissions and UI policy reported by the host for one user and document.
///
/// Built once from the response and never modified. Fields the host omits
/// take the defaults of [`WopiFileInfo::default`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WopiFileInfo {
    pub size: u64,
    pub user_id: String,
    /// Stand-in for the user id in logs, when the host provides one.
    pub obfuscated_user_id: String,
    pub username: String,
    pub user_extra_info: String,
    pub watermark_text: String,
    pub template_save_as: String,
    pub template_source: String,
    pub breadcrumb_doc_name: String,
    /// Alternate download location for the document body.
    pub file_url: String,
    pub post_message_origin: String,
    pub user_can_write: bool,
    pub hide_print_option: bool,
    pub hide_save_option: bool,
    pub hide_export_option: bool,
    pub enable_owner_termination: bool,
    pub disable_print: bool,
    pub disable_export: bool,
    pub disable_copy: bool,
    pub disable_inactive_messages: bool,
    pub download_as_post_message: bool,
    pub user_can_not_write_relative: bool,
    pub enable_insert_remote_image: bool,
    pub enable_share: bool,
    pub supports_locks: bool,
    pub supports_rename: bool,
    pub user_can_rename: bool,
    /// `"true"`, `"false"`, or a comma-separated list of device kinds.
    pub hide_user_list: String,
    pub disable_change_tracking_show: TriState,
    pub disable_change_tracking_record: TriState,
    pub hide_change_tracking_controls: TriState,
}

impl Default for WopiFileInfo {
    fn default() -> Self {
        Self {
            size: 0,
            user_id: String::new(),
            obfuscated_user_id: String::new(),
            username: String::new(),
            user_extra_info: String::new(),
            watermark_text: String::new(),
            template_save_as: String::new(),
            template_source: String::new(),
            breadcrumb_doc_name: String::new(),
            file_url: String::new(),
            post_message_origin: String::new(),
            user_can_write: false,
            hide_print_option: false,
            hide_save_option: false,
            hide_export_option: false,
            enable_owner_termination: false,
            disable_print: false,
            disable_export: false,
            disable_copy: false,
            disable_inactive_messages: false,
            download_as_post_message: false,
            user_can_not_write_relative: true,
            enable_insert_remote_image: false,
            enable_share: false,
            supports_locks: false,
            supports_rename: false,
            user_can_rename: false,
            hide_user_list: "false".to_string(),
            disable_change_tracking_show: TriState::Unset,
            disable_change_tracking_record: TriState::Unset,
            hide_change_tracking_controls: TriState::Unset,
        }
    }
}

impl WopiFileInfo {
    /// Parse a CheckFileInfo object.
    ///
    /// `file_info` is the basic info already extracted from the same object.
    /// A non-empty `watermark_override` replaces the host's watermark.
    pub fn from_json(
        object: &Map<String, Value>,
        file_info: &FileInfo,
        anonymizer: &Anonymizer,
        watermark_override: Option<&str>,
    ) -> Self {
        let mut info = Self::default();
        let string = |key: &str, field: &mut String| {
            if let Some(value) = find_string(object, key) {
                *field = value;
            }
        };
        let boolean = |key: &str, field: &mut bool| {
            if let Some(value) = find_bool(object, key) {
                *field = value;
            }
        };

        info.size = find_u64(object, "Size").unwrap_or(0);
        string("UserId", &mut info.user_id);
        string("UserFriendlyName", &mut info.username);
        string("TemplateSaveAs", &mut info.template_save_as);
        string("TemplateSource", &mut info.template_source);

        if info.username.is_empty() {
            info.username = "UnknownUser".to_string();
            if !info.user_id.is_empty() {
                info.username.push('_');
                info.username.push_str(&info.user_id);
            }
            error!(
                "CheckFileInfo does not specify a valid UserFriendlyName for the current user. \
                 Temporarily [{}] will be used until a valid name is specified",
                anonymizer.username(&info.username)
            );
        }

        if anonymizer.is_enabled() {
            string("ObfuscatedUserId", &mut info.obfuscated_user_id);
            if !info.obfuscated_user_id.is_empty() {
                anonymizer.map(&file_info.owner_id, &info.obfuscated_user_id);
                anonymizer.map(&info.user_id, &info.obfuscated_user_id);
                anonymizer.map(&info.username, &info.obfuscated_user_id);
            }
        }
        debug!("CheckFileInfo: {}", info.loggable(object, file_info, anonymizer));

        string("UserExtraInfo", &mut info.user_extra_info);
        string("WatermarkText", &mut info.watermark_text);
        boolean("UserCanWrite", &mut info.user_can_write);
        string("PostMessageOrigin", &mut info.post_message_origin);
        boolean("HidePrintOption", &mut info.hide_print_option);
        boolean("HideSaveOption", &mut info.hide_save_option);
        boolean("HideExportOption", &mut info.hide_export_option);
        boolean("EnableOwnerTermination", &mut info.enable_owner_termination);
        boolean("DisablePrint", &mut info.disable_print);
        boolean("DisableExport", &mut info.disable_export);
        boolean("DisableCopy", &mut info.disable_copy);
        boolean("DisableInactiveMessages", &mut info.disable_inactive_messages);
        boolean("DownloadAsPostMessage", &mut info.download_as_post_message);
        boolean("UserCanNotWriteRelative", &mut info.user_can_not_write_relative);
        boolean("EnableInsertRemoteImage", &mut info.enable_insert_remote_image);
        boolean("EnableShare", &mut info.enable_share);
        string("HideUserList", &mut info.hide_user_list);
        boolean("SupportsLocks", &mut info.supports_locks);
        boolean("SupportsRename", &mut info.supports_rename);
        boolean("UserCanRename", &mut info.user_can_rename);
        string("BreadcrumbDocName", &mut info.breadcrumb_doc_name);
        string("FileUrl", &mut info.file_url);

        if let Some(value) = find_bool(object, "DisableChangeTrackingRecord") {
            info.disable_change_tracking_record = value.into();
        }
        if let Some(value) = find_bool(object, "DisableChangeTrackingShow") {
            info.disable_change_tracking_show = value.into();
        }
        if let Some(value) = find_bool(object, "HideChangeTrackingControls") {
            info.hide_change_tracking_controls = value.into();
        }

        if let Some(text) = watermark_override.filter(|t| !t.is_empty()) {
            info.watermark_text = text.to_string();
        }
        if is_template(&file_info.filename) {
            info.disable_export = true;
        }

        info
    }

    /// The response with user-identifying fields anonymized, for logging.
    fn loggable(
        &self,
        object: &Map<String, Value>,
        file_info: &FileInfo,
        anonymizer: &Anonymizer,
    ) -> String {
        if !anonymizer.is_enabled() {
            return Value::Object(object.clone()).to_string();
        }

        let mut anon = object.clone();
        anon.insert(
            "BaseFileName".to_string(),
            Value::String(anonymizer.url(&file_info.filename)),
        );
        if self.obfuscated_user_id.is_empty() {
            anon.insert(
                "OwnerId".to_string(),
                Value::String(anonymizer.username(&file_info.owner_id)),
            );
            anon.insert(
                "UserId".to_string(),
                Value::String(anonymizer.username(&self.user_id)),
            );
            anon.insert(
                "UserFriendlyName".to_string(),
                Value::String(anonymizer.username(&self.username)),
            );
        } else {
            for key in ["OwnerId", "UserId", "UserFriendlyName"] {
                anon.insert(
                    key.to_string(),
                    Value::String(self.obfuscated_user_id.clone()),
                );
            }
        }
        Value::Object(anon).to_string()
    }

    /// Map the document name onto the file id in logs.
    pub fn map_filename(anonymizer: &Anonymizer, filename: &str, uri: &str) {
        anonymizer.map(filename_from_url(filename), filename_from_url(uri));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anonymize::anonymize;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    fn parse(value: Value) -> (FileInfo, WopiFileInfo) {
        let object = object(value);
        let file_info = file_info_from_json(&object);
        let info = WopiFileInfo::from_json(&object, &file_info, &Anonymizer::default(), None);
        (file_info, info)
    }

    #[test]
    fn test_check_file_info_basic() {
        let (file_info, info) = parse(json!({
            "BaseFileName": "doc.odt",
            "OwnerId": "u1",
            "LastModifiedTime": "2024-01-01T00:00:00Z",
            "UserCanWrite": true,
            "SupportsLocks": true
        }));

        assert_eq!(
            file_info,
            FileInfo::new("doc.odt", "u1", "2024-01-01T00:00:00Z")
        );
        assert!(info.user_can_write);
        assert!(info.supports_locks);
        assert!(!info.supports_rename);
    }

    #[test]
    fn test_defaults_for_missing_fields() {
        let (file_info, info) = parse(json!({}));
        assert!(!file_info.is_valid());

        let expected = WopiFileInfo {
            username: "UnknownUser".to_string(),
            ..WopiFileInfo::default()
        };
        assert_eq!(info, expected);
        assert!(info.user_can_not_write_relative);
        assert_eq!(info.hide_user_list, "false");
        assert_eq!(info.disable_change_tracking_show, TriState::Unset);
    }

    #[test]
    fn test_unknown_user_fallback_includes_id() {
        let (_, info) = parse(json!({"UserId": "42"}));
        assert_eq!(info.username, "UnknownUser_42");

        let (_, info) = parse(json!({"UserId": "42", "UserFriendlyName": "Alice"}));
        assert_eq!(info.username, "Alice");
    }

    #[test]
    fn test_lenient_value_types() {
        let (_, info) = parse(json!({
            "Size": "1024",
            "UserCanWrite": "true",
            "DisablePrint": 1,
            "UserId": 7,
            "HideUserList": "mobile,tablet",
            "DisableChangeTrackingShow": false,
            "HideChangeTrackingControls": true,
            "UnknownField": {"nested": true}
        }));

        assert_eq!(info.size, 1024);
        assert!(info.user_can_write);
        assert!(info.disable_print);
        assert_eq!(info.user_id, "7");
        assert_eq!(info.hide_user_list, "mobile,tablet");
        assert_eq!(info.disable_change_tracking_show, TriState::False);
        assert_eq!(info.disable_change_tracking_record, TriState::Unset);
        assert_eq!(info.hide_change_tracking_controls, TriState::True);
    }

    #[rstest]
    #[case("report.ott", true)]
    #[case("Letter.DOTX", true)]
    #[case("slides.potm", true)]
    #[case("doc.odt", false)]
    #[case("sheet.xlsx", false)]
    #[case("", false)]
    fn test_is_template(#[case] filename: &str, #[case] expected: bool) {
        assert_eq!(is_template(filename), expected);
    }

    #[test]
    fn test_template_disables_export() {
        let (_, info) = parse(json!({"BaseFileName": "form.ott"}));
        assert!(info.disable_export);
    }

    #[test]
    fn test_watermark_override() {
        let object = object(json!({"WatermarkText": "host"}));
        let file_info = file_info_from_json(&object);
        let anonymizer = Anonymizer::default();

        let info = WopiFileInfo::from_json(&object, &file_info, &anonymizer, Some("global"));
        assert_eq!(info.watermark_text, "global");

        let info = WopiFileInfo::from_json(&object, &file_info, &anonymizer, Some(""));
        assert_eq!(info.watermark_text, "host");
    }

    #[test]
    fn test_obfuscated_user_id_maps_identities() {
        let object = object(json!({
            "BaseFileName": "private.odt",
            "OwnerId": "wopi-info-owner",
            "UserId": "wopi-info-user",
            "UserFriendlyName": "wopi-info-name",
            "ObfuscatedUserId": "obf-77"
        }));
        let file_info = file_info_from_json(&object);
        let anonymizer = Anonymizer::new(true, 5);

        let info = WopiFileInfo::from_json(&object, &file_info, &anonymizer, None);
        assert_eq!(info.obfuscated_user_id, "obf-77");
        assert_eq!(anonymize("wopi-info-owner", 5), "obf-77");
        assert_eq!(anonymize("wopi-info-user", 5), "obf-77");
        assert_eq!(anonymize("wopi-info-name", 5), "obf-77");
    }

    #[test]
    fn test_obfuscated_user_id_ignored_without_anonymization() {
        let (_, info) = parse(json!({"ObfuscatedUserId": "obf-1"}));
        assert_eq!(info.obfuscated_user_id, "");
    }
}
