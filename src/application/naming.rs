//! Maps arbitrary upstream tool and parameter names onto the local
//! identifier grammar `^[A-Za-z0-9_-]+$`.

/// Namespace prefixes some tool servers prepend to every exported name.
const STRIPPED_PREFIXES: &[&str] = &["default_api_", "default-api-"];

/// Replacement for names that collapse to nothing after normalization.
const EMPTY_PLACEHOLDER: &str = "tool";

/// Normalizes a remote identifier: strips known namespace prefixes, then
/// folds snake_case/kebab-case segments and any character outside the local
/// grammar into camelCase boundaries. Pure and deterministic, and idempotent
/// because the output never contains a separator character.
pub fn normalize(remote_name: &str) -> String {
    let mut name = remote_name.trim();
    for prefix in STRIPPED_PREFIXES {
        if let Some(rest) = name.strip_prefix(prefix) {
            name = rest;
            break;
        }
    }

    let mut out = String::with_capacity(name.len());
    let mut upper_next = false;
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            if upper_next {
                out.push(ch.to_ascii_uppercase());
            } else {
                out.push(ch);
            }
            upper_next = false;
        } else if !out.is_empty() {
            // '_', '-' and anything outside the grammar all act as word
            // separators; leading separators are dropped outright.
            upper_next = true;
        }
    }

    if out.is_empty() {
        EMPTY_PLACEHOLDER.to_string()
    } else {
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_valid_local(name: &str) -> bool {
        !name.is_empty()
            && name
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-')
    }

    #[test]
    fn strips_namespace_prefix() {
        assert_eq!(normalize("default_api_join_meeting"), "joinMeeting");
    }

    #[test]
    fn converts_snake_and_kebab_to_camel() {
        assert_eq!(normalize("list_calendar_events"), "listCalendarEvents");
        assert_eq!(normalize("leave-meeting"), "leaveMeeting");
        assert_eq!(normalize("bot_id"), "botId");
    }

    #[test]
    fn keeps_already_normalized_names() {
        assert_eq!(normalize("joinMeeting"), "joinMeeting");
        assert_eq!(normalize("getWeather"), "getWeather");
    }

    #[test]
    fn folds_illegal_characters_into_boundaries() {
        assert_eq!(normalize("tools.search"), "toolsSearch");
        assert_eq!(normalize("a b/c"), "aBC");
        assert_eq!(normalize("weird!!name"), "weirdName");
    }

    #[test]
    fn empty_after_stripping_maps_to_placeholder() {
        assert_eq!(normalize(""), "tool");
        assert_eq!(normalize("default_api_"), "tool");
        assert_eq!(normalize("!!!"), "tool");
    }

    #[test]
    fn digits_survive_separator_boundaries() {
        assert_eq!(normalize("tool_2"), "tool2");
        assert_eq!(normalize("v2_search"), "v2Search");
    }

    #[test]
    fn output_matches_grammar_and_is_idempotent() {
        let inputs = [
            "default_api_join_meeting",
            "bots/metadata sheet",
            "Überraschung",
            "tools.v2.list",
            "a__b--c..d",
            "  padded_name  ",
            "___",
            "ALL_CAPS_NAME",
        ];
        for input in inputs {
            let once = normalize(input);
            assert!(is_valid_local(&once), "invalid output for {input:?}: {once}");
            assert_eq!(normalize(&once), once, "not idempotent for {input:?}");
        }
    }
}
