//! Tool-necessity and memory-write opt-in keyword policy (spec §4.H).

/// A message "needs tools" if it contains any of these (case-insensitive), unless an
/// explicit "no tools" override is present. Kept as a flat list, not a regex: the
/// policy is a membership test, not a grammar.
const TOOL_KEYWORDS: &[&str] = &[
    "status", "restart", "start", "stop", "enable", "disable", "run", "execute", "ls", "dir",
    "pwd", "list", "show", "check", "create", "write", "edit", "delete", "move", "copy",
    "install", "curl", "ssh", "python", "worker", "device", "file", "directory", "folder",
    // non-Latin equivalents (Japanese), shipped verbatim alongside the English list.
    "状態", "再起動", "開始", "停止", "有効", "無効", "実行", "一覧", "表示", "確認", "作成",
    "書き込み", "編集", "削除", "移動", "コピー", "インストール", "デバイス", "ファイル",
    "フォルダ",
];

const NO_TOOLS_OVERRIDES: &[&str] = &["no tools", "without tools", "ツールなし", "ツールを使わず"];

const SAVE_PHRASES: &[&str] = &[
    "save this", "store it", "persist", "保存", "永続", "メモリに",
];

pub fn needs_tools(text: &str) -> bool {
    let lower = text.to_lowercase();
    if NO_TOOLS_OVERRIDES.iter().any(|p| lower.contains(p)) {
        return false;
    }
    if is_remember_phrase(&lower) {
        return is_explicit_save_request(&lower);
    }
    TOOL_KEYWORDS.iter().any(|k| lower.contains(&k.to_lowercase()))
}

/// Explicit "no tools"/"without tools" override (spec §4.H): forbids tools for this
/// item regardless of any keyword match.
pub fn is_no_tools_override(text: &str) -> bool {
    let lower = text.to_lowercase();
    NO_TOOLS_OVERRIDES.iter().any(|p| lower.contains(p))
}

fn is_remember_phrase(lower: &str) -> bool {
    lower.contains("remember") || lower.contains("覚えて")
}

/// Memory-write opt-in gate for `memory_set` / `brain.memory.set` (spec §4.H): refuse
/// unless the user text explicitly asks to save/store/persist.
pub fn is_explicit_save_request(text: &str) -> bool {
    let lower = text.to_lowercase();
    SAVE_PHRASES.iter().any(|p| lower.contains(p))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_keyword_needs_tools() {
        assert!(needs_tools("what's the ssh status?"));
    }

    #[test]
    fn plain_greeting_does_not_need_tools() {
        assert!(!needs_tools("hello, how are you?"));
    }

    #[test]
    fn explicit_no_tools_overrides_keyword() {
        assert!(!needs_tools("check the status, no tools please"));
    }

    #[test]
    fn remember_without_save_phrase_skips_tools() {
        assert!(!needs_tools("remember that I like tea"));
    }

    #[test]
    fn remember_with_save_phrase_needs_tools() {
        assert!(needs_tools("remember this and save this permanently"));
    }

    #[test]
    fn japanese_keyword_needs_tools() {
        assert!(needs_tools("デバイスの状態を確認して"));
    }

    #[test]
    fn save_phrase_recognised_in_japanese() {
        assert!(is_explicit_save_request("これをメモリに保存して"));
    }
}
