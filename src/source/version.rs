//! Decides whether a candidate revision should be applied, given the user's
//! semver constraint and the previously applied revision.

use semver::{Version, VersionReq};

use crate::source::{Decision, SourceError};

/// Parses a release tag leniently: a leading `v` is stripped and missing
/// minor/patch components are padded, so `v1.2` parses as `1.2.0`.
pub fn parse_version(tag: &str) -> Result<Version, SourceError> {
    let trimmed = tag.trim().trim_start_matches('v');

    let (core, rest) = match trimmed.find(['-', '+']) {
        Some(idx) => trimmed.split_at(idx),
        None => (trimmed, ""),
    };

    let dots = core.matches('.').count();
    let padded = match dots {
        0 => format!("{core}.0.0{rest}"),
        1 => format!("{core}.0{rest}"),
        _ => trimmed.to_string(),
    };

    Version::parse(&padded).map_err(|e| SourceError::InvalidVersion {
        version: tag.to_string(),
        message: e.to_string(),
    })
}

/// Parses a constraint expression. Both comma-separated (`>=1.0, <2.0`) and
/// space-separated (`>=v1 <v2`) forms are accepted, and version literals may
/// carry a leading `v`.
pub fn parse_constraint(expr: &str) -> Result<VersionReq, SourceError> {
    let cleaned = expr.replace('v', "");
    let normalized = if cleaned.contains(',') {
        cleaned
    } else {
        // Split on whitespace between comparator groups: ">=1.0 <2.0"
        // becomes ">=1.0, <2.0".
        cleaned.split_whitespace().collect::<Vec<_>>().join(", ")
    };

    VersionReq::parse(&normalized).map_err(|e| SourceError::InvalidConstraint {
        constraint: expr.to_string(),
        message: e.to_string(),
    })
}

/// The update decision for semver-driven sources.
///
/// A candidate outside the constraint never triggers an apply. A satisfying
/// candidate is applied when no revision was applied before, or when it is
/// strictly newer than the applied one; equal or older candidates are
/// skipped so history only ever moves forward. A stored revision that does
/// not parse as semver is a hard error rather than a silent history reset.
pub fn decide(
    candidate: &str,
    last_applied: Option<&str>,
    constraint: &str,
) -> Result<Decision, SourceError> {
    let candidate_version = parse_version(candidate)?;
    let req = parse_constraint(constraint)?;

    if !req.matches(&candidate_version) {
        return Ok(Decision::skip(last_applied.unwrap_or_default()));
    }

    if let Some(last) = last_applied.filter(|l| !l.is_empty()) {
        let last_version = parse_version(last)?;
        if last_version >= candidate_version {
            return Ok(Decision::skip(last));
        }
    }

    Ok(Decision::apply(candidate))
}

/// Picks the highest version among `versions` that both parses as semver and
/// satisfies the constraint. Unparseable entries are skipped.
pub fn pick_latest_satisfying(
    versions: &[String],
    constraint: &str,
) -> Result<String, SourceError> {
    let req = parse_constraint(constraint)?;

    versions
        .iter()
        .filter_map(|raw| parse_version(raw).ok().map(|parsed| (raw, parsed)))
        .filter(|(_, parsed)| req.matches(parsed))
        .max_by(|(_, a), (_, b)| a.cmp(b))
        .map(|(raw, _)| raw.clone())
        .ok_or_else(|| SourceError::NoSatisfyingVersion(constraint.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lenient_version_parsing() {
        assert_eq!(parse_version("v1.2.3").unwrap(), Version::new(1, 2, 3));
        assert_eq!(parse_version("1.0").unwrap(), Version::new(1, 0, 0));
        assert_eq!(parse_version("v2").unwrap(), Version::new(2, 0, 0));
        assert!(parse_version("not-a-version").is_err());
    }

    #[test]
    fn space_separated_constraints() {
        let req = parse_constraint(">=v1 <v2").unwrap();
        assert!(req.matches(&Version::new(1, 5, 0)));
        assert!(!req.matches(&Version::new(2, 0, 0)));
        assert!(!req.matches(&Version::new(0, 9, 0)));
    }

    #[test]
    fn first_apply_takes_candidate() {
        let decision = decide("v1.0.0", None, ">=1.0").unwrap();
        assert_eq!(decision, Decision::apply("v1.0.0"));
    }

    #[test]
    fn equal_candidate_is_no_update() {
        let decision = decide("v1.5.0", Some("v1.5.0"), ">=1.0").unwrap();
        assert_eq!(decision, Decision::skip("v1.5.0"));
    }

    #[test]
    fn older_candidate_never_reapplied() {
        // The source withdrew v1.5 and now only offers v1.2.
        let decision = decide("v1.2.0", Some("v1.5.0"), ">=v1").unwrap();
        assert_eq!(decision, Decision::skip("v1.5.0"));
    }

    #[test]
    fn unsatisfying_candidate_keeps_history() {
        let decision = decide("v2.0.0", Some("v1.5.0"), ">=v1 <v2").unwrap();
        assert_eq!(decision, Decision::skip("v1.5.0"));
    }

    #[test]
    fn malformed_history_is_an_error() {
        // A digest in the history means the source kind was switched; we do
        // not silently reset.
        assert!(decide("v1.6.0", Some("deadbeef012345"), ">=1.0").is_err());
    }

    #[test]
    fn picks_highest_satisfying() {
        let versions = vec![
            "v0.9.0".to_string(),
            "v1.0.0".to_string(),
            "v1.5.0".to_string(),
            "v2.0.0".to_string(),
        ];
        let latest = pick_latest_satisfying(&versions, ">=v1 <v2").unwrap();
        assert_eq!(latest, "v1.5.0");
    }

    #[test]
    fn no_satisfying_version_errors() {
        let versions = vec!["v0.1.0".to_string(), "garbage".to_string()];
        assert!(matches!(
            pick_latest_satisfying(&versions, ">=v1"),
            Err(SourceError::NoSatisfyingVersion(_))
        ));
    }
}
