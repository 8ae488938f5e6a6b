use erie_canal_controller_core::{ClusterKey, ResourceId};
use erie_canal_controller_k8s_api::{
    self as k8s,
    service_export::{CONDITION_CONFLICT, CONDITION_VALID},
    Condition, Time,
};

pub const CONDITION_MANAGED: &str = "Managed";

pub const REASON_SUCCESS: &str = "Success";
pub const REASON_FAILED: &str = "Failed";

/// The export of `service` passed validation in its own cluster, or failed
/// it with `message`.
pub fn valid(
    service: &ResourceId,
    result: Result<(), String>,
    generation: Option<i64>,
) -> Condition {
    match result {
        Ok(()) => condition(
            CONDITION_VALID,
            true,
            REASON_SUCCESS,
            format!("Service {service} is exported successfully."),
            generation,
        ),
        Err(message) => condition(CONDITION_VALID, false, REASON_FAILED, message, generation),
    }
}

/// The export was accepted by the cluster set, or conflicts with an export
/// already accepted.
pub fn conflict(result: Result<(), String>, generation: Option<i64>) -> Condition {
    match result {
        Ok(()) => condition(CONDITION_CONFLICT, false, REASON_SUCCESS, String::new(), generation),
        Err(message) => condition(CONDITION_CONFLICT, true, REASON_FAILED, message, generation),
    }
}

/// The cluster joined the cluster set, or failed to.
pub fn managed(key: &ClusterKey, result: Result<(), String>, generation: Option<i64>) -> Condition {
    match result {
        Ok(()) => condition(
            CONDITION_MANAGED,
            true,
            REASON_SUCCESS,
            format!("Cluster {key} joined ClusterSet successfully."),
            generation,
        ),
        Err(error) => condition(
            CONDITION_MANAGED,
            false,
            REASON_FAILED,
            format!("Cluster {key} failed to join ClusterSet: {error}."),
            generation,
        ),
    }
}

fn condition(
    type_: &str,
    status: bool,
    reason: &str,
    message: String,
    observed_generation: Option<i64>,
) -> Condition {
    Condition {
        type_: type_.to_string(),
        status: if status { "True" } else { "False" }.to_string(),
        reason: reason.to_string(),
        message,
        observed_generation,
        last_transition_time: now(),
    }
}

/// Sets `new` in `conditions`, replacing the condition of the same type.
///
/// The transition time of an existing condition is kept unless its status
/// changes.
pub fn set_condition(conditions: &mut Vec<Condition>, new: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == new.type_) {
        Some(existing) => {
            if existing.status != new.status {
                existing.status = new.status;
                existing.last_transition_time = new.last_transition_time;
            }
            existing.reason = new.reason;
            existing.message = new.message;
            existing.observed_generation = new.observed_generation;
        }
        None => conditions.push(new),
    }
}

/// Applies `updates` to `current`, returning the resulting conditions only
/// if they differ from `current`.
pub(crate) fn merge(
    current: &[Condition],
    updates: impl IntoIterator<Item = Condition>,
) -> Option<Vec<Condition>> {
    let mut conditions = current.to_vec();
    for update in updates {
        set_condition(&mut conditions, update);
    }
    (conditions != current).then_some(conditions)
}

fn now() -> k8s::Time {
    #[cfg(not(test))]
    let timestamp = chrono::Utc::now();
    #[cfg(test)]
    let timestamp = chrono::DateTime::<chrono::Utc>::MIN_UTC;
    Time(timestamp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn at(secs: i64) -> Time {
        Time(chrono::DateTime::<chrono::Utc>::from_timestamp(secs, 0).expect("valid timestamp"))
    }

    #[test]
    fn managed_messages() {
        let key = "east/z1/g1/c1".parse::<ClusterKey>().unwrap();
        let ok = managed(&key, Ok(()), Some(2));
        assert_eq!(ok.status, "True");
        assert_eq!(ok.reason, REASON_SUCCESS);
        assert_eq!(ok.message, "Cluster east/z1/g1/c1 joined ClusterSet successfully.");
        assert_eq!(ok.observed_generation, Some(2));

        let failed = managed(&key, Err("connection refused".to_string()), None);
        assert_eq!(failed.status, "False");
        assert_eq!(failed.reason, REASON_FAILED);
        assert_eq!(
            failed.message,
            "Cluster east/z1/g1/c1 failed to join ClusterSet: connection refused."
        );
    }

    #[test]
    fn conflict_is_inverted() {
        assert_eq!(conflict(Ok(()), None).status, "False");
        let c = conflict(Err("port mismatch".to_string()), None);
        assert_eq!(c.type_, CONDITION_CONFLICT);
        assert_eq!(c.status, "True");
        assert_eq!(c.message, "port mismatch");
    }

    fn api() -> ResourceId {
        ResourceId::new("demo", "api")
    }

    #[test]
    fn valid_names_the_service() {
        let ok = valid(&api(), Ok(()), None);
        assert_eq!(ok.status, "True");
        assert_eq!(ok.message, "Service demo/api is exported successfully.");
        let failed = valid(&api(), Err("Service demo/api not found".to_string()), None);
        assert_eq!(failed.status, "False");
        assert_eq!(failed.reason, REASON_FAILED);
        assert_eq!(failed.message, "Service demo/api not found");
    }

    #[test]
    fn transition_time_kept_while_status_holds() {
        let mut existing = valid(&api(), Ok(()), Some(1));
        existing.last_transition_time = at(100);
        let mut conditions = vec![existing];

        set_condition(&mut conditions, valid(&api(), Ok(()), Some(2)));
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].last_transition_time, at(100));
        assert_eq!(conditions[0].observed_generation, Some(2));

        set_condition(
            &mut conditions,
            valid(&api(), Err("no such service".to_string()), Some(3)),
        );
        assert_eq!(conditions[0].status, "False");
        assert_eq!(conditions[0].message, "no such service");
        assert_eq!(conditions[0].last_transition_time, now());
    }

    #[test]
    fn merge_skips_unchanged_conditions() {
        let current = vec![valid(&api(), Ok(()), None), conflict(Ok(()), None)];
        assert_eq!(merge(&current, [conflict(Ok(()), None)]), None);

        let merged = merge(&current, [conflict(Err("taken".to_string()), None)])
            .expect("conditions must change");
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0], current[0]);
        assert_eq!(merged[1].status, "True");

        let added = merge(&[], [valid(&api(), Ok(()), None)]).expect("condition must be added");
        assert_eq!(added.len(), 1);
    }
}
