use chrono::{Duration, Months, NaiveDateTime, Utc};

use crate::core::error::StoreError;

/// Timestamp format shared by every table. Matches the shape SQLite's
/// CURRENT_TIMESTAMP produces, so string comparison orders chronologically.
pub const TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn now_ts() -> String {
    Utc::now().format(TS_FORMAT).to_string()
}

pub fn format_ts(ts: NaiveDateTime) -> String {
    ts.format(TS_FORMAT).to_string()
}

pub fn parse_ts(raw: &str) -> Result<NaiveDateTime, StoreError> {
    NaiveDateTime::parse_from_str(raw, TS_FORMAT)
        .map_err(|_| StoreError::InvalidInput(format!("bad timestamp: {raw}")))
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct AgentKeyRecord {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub prefix: String,
    pub default_principal: Option<String>,
    pub created_at: String,
    pub last_used_at: Option<String>,
    pub revoked_at: Option<String>,
}

impl AgentKeyRecord {
    pub fn is_active(&self) -> bool {
        self.revoked_at.is_none()
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct AgentHostRecord {
    pub id: String,
    pub agent_id: String,
    pub display_name: String,
    pub last_seen_at: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct IngestedMessageRecord {
    pub id: String,
    pub doc_key: Option<String>,
    pub agent_id: Option<String>,
    pub payload: String,
    pub key_id: String,
    pub received_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Scheduled,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Scheduled => "scheduled",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_status(value: &str) -> Option<Self> {
        match value {
            "scheduled" => Some(JobStatus::Scheduled),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// The job lifecycle edge list. `Running -> Scheduled` is the re-arm edge
    /// taken by recurring jobs when a sweep finishes them.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Scheduled, JobStatus::Running)
                | (JobStatus::Scheduled, JobStatus::Cancelled)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Scheduled)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recurrence {
    Once,
    Daily,
    Weekly,
    Monthly,
}

impl Recurrence {
    pub fn as_str(self) -> &'static str {
        match self {
            Recurrence::Once => "once",
            Recurrence::Daily => "daily",
            Recurrence::Weekly => "weekly",
            Recurrence::Monthly => "monthly",
        }
    }

    pub fn from_status(value: &str) -> Option<Self> {
        match value {
            "once" => Some(Recurrence::Once),
            "daily" => Some(Recurrence::Daily),
            "weekly" => Some(Recurrence::Weekly),
            "monthly" => Some(Recurrence::Monthly),
            _ => None,
        }
    }

    /// Next occurrence computed from the PRIOR scheduled run, never from the
    /// wall clock, so recurring jobs do not drift when sweeps run late.
    pub fn next_run_at(self, prior: NaiveDateTime) -> Option<NaiveDateTime> {
        match self {
            Recurrence::Once => None,
            Recurrence::Daily => Some(prior + Duration::days(1)),
            Recurrence::Weekly => Some(prior + Duration::days(7)),
            Recurrence::Monthly => prior.checked_add_months(Months::new(1)),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ScheduledJobRecord {
    pub id: String,
    pub name: String,
    pub action_type: String,
    pub status: JobStatus,
    pub run_at: String,
    pub recurrence: Recurrence,
    pub target_hosts: Vec<String>,
    pub payload: serde_json::Value,
    pub created_by: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    Sent,
    Acknowledged,
    Failed,
    Expired,
}

impl CommandStatus {
    pub const ALL: [CommandStatus; 5] = [
        CommandStatus::Pending,
        CommandStatus::Sent,
        CommandStatus::Acknowledged,
        CommandStatus::Failed,
        CommandStatus::Expired,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CommandStatus::Pending => "pending",
            CommandStatus::Sent => "sent",
            CommandStatus::Acknowledged => "acknowledged",
            CommandStatus::Failed => "failed",
            CommandStatus::Expired => "expired",
        }
    }

    pub fn from_status(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(CommandStatus::Pending),
            "sent" => Some(CommandStatus::Sent),
            "acknowledged" => Some(CommandStatus::Acknowledged),
            "failed" => Some(CommandStatus::Failed),
            "expired" => Some(CommandStatus::Expired),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CommandStatus::Acknowledged | CommandStatus::Failed | CommandStatus::Expired
        )
    }

    /// Forward-only command lifecycle. Acknowledged, failed and expired are
    /// terminal; nothing leaves them.
    pub fn can_transition_to(self, next: CommandStatus) -> bool {
        match self {
            CommandStatus::Pending => matches!(
                next,
                CommandStatus::Sent
                    | CommandStatus::Acknowledged
                    | CommandStatus::Failed
                    | CommandStatus::Expired
            ),
            CommandStatus::Sent => matches!(
                next,
                CommandStatus::Acknowledged | CommandStatus::Failed | CommandStatus::Expired
            ),
            CommandStatus::Acknowledged | CommandStatus::Failed | CommandStatus::Expired => false,
        }
    }

    /// States a conditional UPDATE may move from when targeting `next`.
    pub fn sources_for(next: CommandStatus) -> Vec<CommandStatus> {
        CommandStatus::ALL
            .iter()
            .copied()
            .filter(|s| s.can_transition_to(next))
            .collect()
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct RemoteCommandRecord {
    pub id: String,
    pub agent_id: String,
    pub action_type: String,
    pub payload: serde_json::Value,
    pub status: CommandStatus,
    pub detail: Option<String>,
    pub source_job_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkVisibility {
    Public,
    Restricted,
}

impl LinkVisibility {
    pub fn as_str(self) -> &'static str {
        match self {
            LinkVisibility::Public => "public",
            LinkVisibility::Restricted => "restricted",
        }
    }

    pub fn from_status(value: &str) -> Option<Self> {
        match value {
            "public" => Some(LinkVisibility::Public),
            "restricted" => Some(LinkVisibility::Restricted),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct DownloadLinkRecord {
    pub id: String,
    pub token: String,
    pub visibility: LinkVisibility,
    pub created_by: String,
    pub created_at: String,
    pub expires_at: Option<String>,
    pub revoked_at: Option<String>,
}

impl DownloadLinkRecord {
    /// Active = not revoked and expiry (if any) strictly in the future.
    pub fn is_active_at(&self, now: &str) -> bool {
        if self.revoked_at.is_some() {
            return false;
        }
        match &self.expires_at {
            Some(expires) => expires.as_str() > now,
            None => true,
        }
    }

    pub fn is_active(&self) -> bool {
        self.is_active_at(&now_ts())
    }

    pub fn require_login(&self) -> bool {
        self.visibility == LinkVisibility::Restricted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_status_round_trips_through_strings() {
        for status in [
            JobStatus::Scheduled,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(JobStatus::from_status(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::from_status("bogus"), None);
    }

    #[test]
    fn job_terminal_states_have_no_outgoing_edges() {
        for terminal in [JobStatus::Completed, JobStatus::Failed, JobStatus::Cancelled] {
            assert!(terminal.is_terminal());
            for next in [
                JobStatus::Scheduled,
                JobStatus::Running,
                JobStatus::Completed,
                JobStatus::Failed,
                JobStatus::Cancelled,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn cancel_only_allowed_from_scheduled() {
        assert!(JobStatus::Scheduled.can_transition_to(JobStatus::Cancelled));
        assert!(!JobStatus::Running.can_transition_to(JobStatus::Cancelled));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Cancelled));
    }

    #[test]
    fn command_terminal_states_reject_everything() {
        for terminal in [
            CommandStatus::Acknowledged,
            CommandStatus::Failed,
            CommandStatus::Expired,
        ] {
            assert!(terminal.is_terminal());
            for next in CommandStatus::ALL {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn command_sources_derive_from_transition_table() {
        let sources = CommandStatus::sources_for(CommandStatus::Sent);
        assert_eq!(sources, vec![CommandStatus::Pending]);

        let ack_sources = CommandStatus::sources_for(CommandStatus::Acknowledged);
        assert_eq!(
            ack_sources,
            vec![CommandStatus::Pending, CommandStatus::Sent]
        );
    }

    #[test]
    fn daily_recurrence_advances_exactly_one_day() {
        let prior = parse_ts("2026-03-01 09:30:00").unwrap();
        let next = Recurrence::Daily.next_run_at(prior).unwrap();
        assert_eq!(format_ts(next), "2026-03-02 09:30:00");
    }

    #[test]
    fn weekly_recurrence_advances_seven_days() {
        let prior = parse_ts("2026-03-01 09:30:00").unwrap();
        let next = Recurrence::Weekly.next_run_at(prior).unwrap();
        assert_eq!(format_ts(next), "2026-03-08 09:30:00");
    }

    #[test]
    fn monthly_recurrence_clamps_end_of_month() {
        let prior = parse_ts("2026-01-31 06:00:00").unwrap();
        let next = Recurrence::Monthly.next_run_at(prior).unwrap();
        assert_eq!(format_ts(next), "2026-02-28 06:00:00");
    }

    #[test]
    fn once_has_no_next_occurrence() {
        let prior = parse_ts("2026-03-01 09:30:00").unwrap();
        assert!(Recurrence::Once.next_run_at(prior).is_none());
    }

    #[test]
    fn link_with_past_or_equal_expiry_is_inactive() {
        let link = DownloadLinkRecord {
            id: "l1".into(),
            token: "t".into(),
            visibility: LinkVisibility::Public,
            created_by: "ops".into(),
            created_at: "2026-03-01 09:00:00".into(),
            expires_at: Some("2026-03-01 09:00:00".into()),
            revoked_at: None,
        };
        assert!(!link.is_active_at("2026-03-01 09:00:00"));
        assert!(link.is_active_at("2026-03-01 08:59:59"));
    }

    #[test]
    fn revoked_link_is_inactive_regardless_of_expiry() {
        let link = DownloadLinkRecord {
            id: "l2".into(),
            token: "t".into(),
            visibility: LinkVisibility::Restricted,
            created_by: "ops".into(),
            created_at: "2026-03-01 09:00:00".into(),
            expires_at: None,
            revoked_at: Some("2026-03-01 10:00:00".into()),
        };
        assert!(!link.is_active_at("2026-03-01 09:30:00"));
        assert!(link.require_login());
    }
}
