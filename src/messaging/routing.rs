use crate::event_sourcing::{AggregateType, Event, EventType};

// ============================================================================
// Topic Routing
// ============================================================================
//
// Routing keys are `{prefix}.{aggregateType}.{eventType}`. Binding patterns
// follow AMQP topic rules: `*` matches exactly one dot-separated segment,
// `#` matches zero or more.
//
// ============================================================================

pub fn routing_key(prefix: &str, aggregate_type: &AggregateType, event_type: &EventType) -> String {
    format!("{prefix}.{aggregate_type}.{event_type}")
}

pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_segments(&pattern, &key)
}

fn match_segments(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_segments(rest, &key[skip..])),
        Some((&segment, rest)) => match key.split_first() {
            Some((&word, key_rest)) => (segment == "*" || segment == word) && match_segments(rest, key_rest),
            None => false,
        },
    }
}

/// Selects the events a subscription receives.
///
/// The default matcher is `Never`, so a subscription built from an unset
/// matcher receives nothing. Constraints combine with [`Matcher::and`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Matcher {
    #[default]
    Never,
    Pattern {
        aggregate_type: Option<AggregateType>,
        event_type: Option<EventType>,
    },
}

impl Matcher {
    pub fn any() -> Self {
        Matcher::Pattern {
            aggregate_type: None,
            event_type: None,
        }
    }

    pub fn event_type(event_type: EventType) -> Self {
        Matcher::Pattern {
            aggregate_type: None,
            event_type: Some(event_type),
        }
    }

    pub fn aggregate_type(aggregate_type: AggregateType) -> Self {
        Matcher::Pattern {
            aggregate_type: Some(aggregate_type),
            event_type: None,
        }
    }

    /// Both constraints must hold. Contradicting constraints never match.
    pub fn and(self, other: Matcher) -> Matcher {
        match (self, other) {
            (
                Matcher::Pattern {
                    aggregate_type: a1,
                    event_type: e1,
                },
                Matcher::Pattern {
                    aggregate_type: a2,
                    event_type: e2,
                },
            ) => {
                let (Some(aggregate_type), Some(event_type)) = (narrow(a1, a2), narrow(e1, e2)) else {
                    return Matcher::Never;
                };
                Matcher::Pattern {
                    aggregate_type,
                    event_type,
                }
            }
            _ => Matcher::Never,
        }
    }

    /// Binding pattern for this matcher, or `None` for `Never`.
    ///
    /// Type names may contain dots, so unset segments bind with `#`. The
    /// binding can over-deliver; consumers filter with [`Matcher::matches`].
    pub fn routing_pattern(&self, prefix: &str) -> Option<String> {
        match self {
            Matcher::Never => None,
            Matcher::Pattern {
                aggregate_type,
                event_type,
            } => Some(match (aggregate_type, event_type) {
                (None, None) => format!("{prefix}.#"),
                (Some(aggregate), None) => format!("{prefix}.{aggregate}.#"),
                (None, Some(event)) => format!("{prefix}.#.{event}"),
                (Some(aggregate), Some(event)) => format!("{prefix}.{aggregate}.{event}"),
            }),
        }
    }

    pub fn matches(&self, event: &Event) -> bool {
        match self {
            Matcher::Never => false,
            Matcher::Pattern {
                aggregate_type,
                event_type,
            } => {
                aggregate_type.as_ref().map_or(true, |t| t == event.aggregate_type())
                    && event_type.as_ref().map_or(true, |t| t == event.event_type())
            }
        }
    }
}

/// `Some(constraint)` if the two are compatible, `None` if they contradict.
fn narrow<T: PartialEq>(left: Option<T>, right: Option<T>) -> Option<Option<T>> {
    match (left, right) {
        (Some(l), Some(r)) if l != r => None,
        (Some(l), _) => Some(Some(l)),
        (None, r) => Some(r),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> AggregateType {
        AggregateType::new("User").unwrap()
    }

    fn created() -> EventType {
        EventType::new("UserCreated").unwrap()
    }

    #[test]
    fn test_routing_key_format() {
        assert_eq!(routing_key("events", &user(), &created()), "events.User.UserCreated");
    }

    #[test]
    fn test_topic_wildcards() {
        assert!(topic_matches("events.*.*", "events.User.UserCreated"));
        assert!(topic_matches("events.#", "events.User.UserCreated"));
        assert!(topic_matches("events.User.#", "events.User"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(!topic_matches("events.*", "events.User.UserCreated"));
        assert!(!topic_matches("events.Team.*", "events.User.UserCreated"));
        assert!(!topic_matches("audit.#", "events.User.UserCreated"));
    }

    #[test]
    fn test_matcher_patterns() {
        assert_eq!(Matcher::any().routing_pattern("events").unwrap(), "events.#");
        assert_eq!(
            Matcher::aggregate_type(user())
                .and(Matcher::event_type(created()))
                .routing_pattern("events")
                .unwrap(),
            "events.User.UserCreated"
        );
        assert_eq!(Matcher::default().routing_pattern("events"), None);
    }

    #[test]
    fn test_bindings_reach_dotted_type_names() {
        let cluster = AggregateType::new("k8s.Cluster").unwrap();
        let key = routing_key("events", &cluster, &EventType::new("ClusterCreated").unwrap());

        for matcher in [
            Matcher::any(),
            Matcher::aggregate_type(cluster.clone()),
            Matcher::event_type(EventType::new("ClusterCreated").unwrap()),
        ] {
            let pattern = matcher.routing_pattern("events").unwrap();
            assert!(topic_matches(&pattern, &key), "{pattern} should bind {key}");
        }

        let narrow = Matcher::aggregate_type(user()).routing_pattern("events").unwrap();
        assert!(!topic_matches(&narrow, &key));
    }

    #[test]
    fn test_contradicting_constraints_never_match() {
        let matcher = Matcher::aggregate_type(user()).and(Matcher::aggregate_type(AggregateType::new("Team").unwrap()));
        assert_eq!(matcher, Matcher::Never);
        assert_eq!(Matcher::Never.and(Matcher::any()), Matcher::Never);
    }
}
