//! `.well-known/agent-card.json`: the A2A agent discovery document, built
//! by deep-merging a per-room override (room id, endpoint URL) onto a
//! shared base template supplied by the caller (deployment-wide fields like
//! `provider`, default `capabilities`/`skills`).

use serde_json::{json, Value};

/// Merges `override_` onto `base`, recursing into nested objects and
/// otherwise letting `override_` win. Arrays are replaced wholesale, not
/// concatenated — a room-level `skills` override is meant to be the full
/// list, not an addition to the template's.
pub fn deep_merge(base: &Value, override_: &Value) -> Value {
    match (base, override_) {
        (Value::Object(base_map), Value::Object(override_map)) => {
            let mut merged = base_map.clone();
            for (key, value) in override_map {
                let next = match merged.get(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value.clone(),
                };
                merged.insert(key.clone(), next);
            }
            Value::Object(merged)
        }
        (_, override_) => override_.clone(),
    }
}

/// Builds the agent card for a specific room: merges `name`, `url`
/// (pointing at that room's `/a2a` endpoint), and `skills[].id` onto the
/// deployment's base template.
pub fn build_for_room(base: &Value, room_id: &str, base_url: &str) -> Value {
    let override_ = json!({
        "name": format!("{room_id} bridge"),
        "url": format!("{base_url}/api/rooms/{room_id}/a2a"),
        "capabilities": { "streaming": true },
    });
    deep_merge(base, &override_)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_wins_on_scalar_conflict() {
        let base = json!({ "name": "template", "version": "1.0" });
        let override_ = json!({ "name": "room-42 bridge" });
        let merged = deep_merge(&base, &override_);
        assert_eq!(merged["name"], "room-42 bridge");
        assert_eq!(merged["version"], "1.0");
    }

    #[test]
    fn nested_objects_merge_rather_than_replace() {
        let base = json!({ "capabilities": { "streaming": false, "pushNotifications": true } });
        let override_ = json!({ "capabilities": { "streaming": true } });
        let merged = deep_merge(&base, &override_);
        assert_eq!(merged["capabilities"]["streaming"], true);
        assert_eq!(merged["capabilities"]["pushNotifications"], true);
    }

    #[test]
    fn build_for_room_points_url_at_the_room_endpoint() {
        let base = json!({ "provider": { "name": "acme" } });
        let card = build_for_room(&base, "room-7", "https://example.test");
        assert_eq!(card["url"], "https://example.test/api/rooms/room-7/a2a");
        assert_eq!(card["provider"]["name"], "acme");
    }
}
