// Copyright 2025 coScene
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// MQTT topic names and filters

/// Whether `topic` is matched by subscription `filter` (`+` single level, `#` rest)
pub fn matches(filter: &str, topic: &str) -> bool {
    // Wildcards never match system topics at the first level
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// A topic a message may be published to
pub fn is_valid_topic_name(topic: &str) -> bool {
    !topic.is_empty() && !topic.contains(['+', '#'])
}

/// A subscription filter with well-placed wildcards
pub fn is_valid_filter(filter: &str) -> bool {
    if filter.is_empty() {
        return false;
    }
    let levels: Vec<&str> = filter.split('/').collect();
    let last = levels.len() - 1;
    levels.iter().enumerate().all(|(i, level)| match *level {
        "#" => i == last,
        "+" => true,
        other => !other.contains(['+', '#']),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match() {
        assert!(matches("sensors/env", "sensors/env"));
        assert!(!matches("sensors/env", "sensors/env/extra"));
        assert!(!matches("sensors/env", "sensors"));
    }

    #[test]
    fn test_single_level_wildcard() {
        assert!(matches("sensors/+", "sensors/env"));
        assert!(matches("+/env", "sensors/env"));
        assert!(!matches("sensors/+", "sensors/env/room1"));
        assert!(!matches("sensors/+", "sensors"));
    }

    #[test]
    fn test_multi_level_wildcard() {
        assert!(matches("sensors/#", "sensors/env/room1"));
        assert!(matches("sensors/#", "sensors"));
        assert!(matches("#", "anything/at/all"));
    }

    #[test]
    fn test_system_topics_skip_wildcards() {
        assert!(!matches("#", "$SYS/broker/uptime"));
        assert!(!matches("+/broker/uptime", "$SYS/broker/uptime"));
        assert!(matches("$SYS/#", "$SYS/broker/uptime"));
    }

    #[test]
    fn test_filter_validation() {
        assert!(is_valid_filter("sensors/+/temp"));
        assert!(is_valid_filter("sensors/#"));
        assert!(!is_valid_filter("sensors/#/temp"));
        assert!(!is_valid_filter("sensors/te+mp"));
        assert!(!is_valid_filter(""));
    }

    #[test]
    fn test_topic_name_validation() {
        assert!(is_valid_topic_name("sensors/env"));
        assert!(!is_valid_topic_name("sensors/+"));
        assert!(!is_valid_topic_name(""));
    }
}
