//! Pacing, backoff, and error-classification policy.

use std::sync::LazyLock;
use std::time::Duration;

use rand::Rng;
use regex::Regex;

use cadence_store::PacingConfig;

/// Escalating cooldown, in minutes, for the Nth consecutive rate-limit
/// response. Capped at the last entry.
pub const BACKOFF_MINUTES: [u64; 4] = [1, 3, 9, 15];

/// Clean deliveries required before a nonzero rate-limit counter is
/// forgiven.
pub const TRUST_RESTORE_STREAK: i32 = 10;

/// Platform rejections that will never succeed on retry, with the reason
/// recorded on the skipped target.
static PERMANENT_REJECTIONS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (
            r"(?i)cannot send messages to this user",
            "Recipient does not accept direct messages",
        ),
        (
            r"(?i)you are unable to (message|contact) this (user|account)",
            "Recipient does not accept direct messages",
        ),
        (
            r"(?i)does not accept (new )?(direct )?messages",
            "Recipient does not accept direct messages",
        ),
        (
            r"(?i)protected (account|profile|tweets)",
            "Recipient account is protected",
        ),
        (r"(?i)blocked you", "Recipient has blocked this account"),
    ]
    .into_iter()
    .map(|(pattern, reason)| (Regex::new(pattern).expect("valid rejection pattern"), reason))
    .collect()
});

/// Backoff for the Nth consecutive rate limit (1-based).
pub fn backoff_duration(consecutive: i32) -> Duration {
    let n = consecutive.max(1) as usize;
    let minutes = BACKOFF_MINUTES[n.min(BACKOFF_MINUTES.len()) - 1];
    Duration::from_secs(minutes * 60)
}

/// Total attempts a target gets: the first one plus the configured number
/// of additional retries.
pub fn max_attempts(retry_attempts: i32) -> i32 {
    retry_attempts.max(0) + 1
}

/// Randomized post-action delay, uniformly sampled from the configured
/// window.
pub fn pacing_delay(pacing: &PacingConfig) -> Duration {
    let min = pacing.delay_min_secs.max(0) as u64;
    let max = (pacing.delay_max_secs.max(0) as u64).max(min);
    if min == max {
        return Duration::from_secs(min);
    }
    Duration::from_secs(rand::thread_rng().gen_range(min..=max))
}

/// Classify an error message; returns the human-readable skip reason when
/// the rejection is permanent.
pub fn classify_permanent(error: &str) -> Option<&'static str> {
    PERMANENT_REJECTIONS
        .iter()
        .find(|(pattern, _)| pattern.is_match(error))
        .map(|(_, reason)| *reason)
}

/// Substitute `{{name}}` and `{{username}}` placeholders. `{{name}}` falls
/// back to the username when no display name is known.
pub fn render_template(template: &str, username: &str, display_name: Option<&str>) -> String {
    let name = display_name.filter(|n| !n.is_empty()).unwrap_or(username);
    template
        .replace("{{name}}", name)
        .replace("{{username}}", username)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use test_case::test_case;

    #[test_case(1, 60; "first rate limit waits one minute")]
    #[test_case(2, 180; "second waits three minutes")]
    #[test_case(3, 540; "third waits nine minutes")]
    #[test_case(4, 900; "fourth waits fifteen minutes")]
    #[test_case(5, 900; "capped beyond the table")]
    #[test_case(100, 900; "deep into the cap")]
    fn backoff_follows_the_table(consecutive: i32, expected_secs: u64) {
        assert_eq!(backoff_duration(consecutive).as_secs(), expected_secs);
    }

    #[test_case(0, 1; "zero retries means one attempt")]
    #[test_case(1, 2)]
    #[test_case(3, 4)]
    fn retry_budget_counts_additional_attempts(retry_attempts: i32, expected: i32) {
        assert_eq!(max_attempts(retry_attempts), expected);
    }

    #[test]
    fn permanent_rejections_are_recognized() {
        assert_eq!(
            classify_permanent("HTTP 403: You cannot send messages to this user."),
            Some("Recipient does not accept direct messages")
        );
        assert_eq!(
            classify_permanent("This is a protected account"),
            Some("Recipient account is protected")
        );
        assert_eq!(
            classify_permanent("the user has blocked you"),
            Some("Recipient has blocked this account")
        );
        assert_eq!(classify_permanent("HTTP 500: something broke"), None);
        assert_eq!(classify_permanent("connection reset by peer"), None);
    }

    #[test]
    fn template_substitutes_both_placeholders() {
        let rendered = render_template(
            "Hey {{name}}, saw your profile @{{username}}!",
            "jdoe",
            Some("Jane"),
        );
        assert_eq!(rendered, "Hey Jane, saw your profile @jdoe!");
    }

    #[test]
    fn template_name_falls_back_to_username() {
        assert_eq!(render_template("Hi {{name}}", "jdoe", None), "Hi jdoe");
        assert_eq!(render_template("Hi {{name}}", "jdoe", Some("")), "Hi jdoe");
    }

    proptest! {
        // Backoff is monotonically non-decreasing and bounded by the cap.
        #[test]
        fn backoff_monotonic_and_bounded(a in 1i32..50, b in 1i32..50) {
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(backoff_duration(lo) <= backoff_duration(hi));
            prop_assert!(backoff_duration(hi).as_secs() <= BACKOFF_MINUTES[3] * 60);
            prop_assert!(backoff_duration(lo).as_secs() >= BACKOFF_MINUTES[0] * 60);
        }

        // The sampled delay always lands inside the configured window.
        #[test]
        fn pacing_delay_within_bounds(min in 0i32..120, spread in 0i32..120) {
            let pacing = PacingConfig {
                per_minute: 1,
                delay_min_secs: min,
                delay_max_secs: min + spread,
                daily_cap: 1,
                retry_attempts: 0,
            };
            let delay = pacing_delay(&pacing).as_secs();
            prop_assert!(delay >= min as u64);
            prop_assert!(delay <= (min + spread) as u64);
        }

        // Rendering never leaves a known placeholder behind.
        #[test]
        fn rendering_consumes_placeholders(username in "[a-z]{1,12}") {
            let rendered = render_template("{{name}} / {{username}}", &username, None);
            prop_assert!(!rendered.contains("{{name}}"));
            prop_assert!(!rendered.contains("{{username}}"));
        }
    }
}
