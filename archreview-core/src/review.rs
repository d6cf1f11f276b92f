//! Review data model shared by the server and the CLI.
//!
//! Subject attributes (account, region, pillar) are parsed into newtypes at
//! the edge so that an invalid value can never reach the store or the queue.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Regions a review may target.
pub const SUPPORTED_REGIONS: &[&str] = &[
    "us-east-1",
    "us-east-2",
    "us-west-1",
    "us-west-2",
    "ap-northeast-1",
    "ap-northeast-2",
    "ap-southeast-1",
    "ap-southeast-2",
    "eu-west-1",
    "eu-west-2",
    "eu-central-1",
];

/// Length of an account identifier.
pub const ACCOUNT_ID_LEN: usize = 12;

/// Rejected subject attribute.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("awsAccountId must be exactly 12 digits")]
    AccountId,
    #[error("unsupported region '{0}'")]
    Region(String),
    #[error("unknown pillar '{0}'")]
    Pillar(String),
    #[error("'{0}' is not a valid review id")]
    ReviewId(String),
    #[error("unknown review status '{0}'")]
    Status(String),
    #[error("score {0} is outside [0, 100]")]
    Score(f64),
}

// =============================================================================
// Identifiers and subject attributes
// =============================================================================

/// Globally unique review identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReviewId(pub Uuid);

impl ReviewId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ReviewId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ReviewId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ReviewId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|_| ValidationError::ReviewId(s.to_string()))
    }
}

/// Twelve-digit account identifier of the reviewed account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AccountId(String);

impl AccountId {
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let trimmed = raw.trim();
        if trimmed.len() == ACCOUNT_ID_LEN && trimmed.bytes().all(|b| b.is_ascii_digit()) {
            Ok(Self(trimmed.to_string()))
        } else {
            Err(ValidationError::AccountId)
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for AccountId {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<AccountId> for String {
    fn from(id: AccountId) -> Self {
        id.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Target region, restricted to [`SUPPORTED_REGIONS`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Region(String);

impl Region {
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let trimmed = raw.trim();
        if SUPPORTED_REGIONS.contains(&trimmed) {
            Ok(Self(trimmed.to_string()))
        } else {
            Err(ValidationError::Region(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Region {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Region> for String {
    fn from(region: Region) -> Self {
        region.0
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Focus area of a review. Absence means every pillar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Pillar {
    OperationalExcellence,
    Security,
    Reliability,
    PerformanceEfficiency,
    CostOptimization,
    Sustainability,
}

impl Pillar {
    pub const ALL: [Pillar; 6] = [
        Pillar::OperationalExcellence,
        Pillar::Security,
        Pillar::Reliability,
        Pillar::PerformanceEfficiency,
        Pillar::CostOptimization,
        Pillar::Sustainability,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OperationalExcellence => "operational-excellence",
            Self::Security => "security",
            Self::Reliability => "reliability",
            Self::PerformanceEfficiency => "performance-efficiency",
            Self::CostOptimization => "cost-optimization",
            Self::Sustainability => "sustainability",
        }
    }

    /// Parse an optional pillar filter. Empty input selects all pillars.
    pub fn parse_optional(raw: Option<&str>) -> Result<Option<Self>, ValidationError> {
        match raw.map(str::trim) {
            None | Some("") => Ok(None),
            Some(value) => value.parse().map(Some),
        }
    }
}

impl FromStr for Pillar {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ValidationError::Pillar(s.to_string()))
    }
}

impl fmt::Display for Pillar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a review evaluates. Immutable after creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewSubject {
    pub account_id: AccountId,
    pub region: Region,
    pub pillar: Option<Pillar>,
}

impl ReviewSubject {
    /// Validate raw submission fields.
    pub fn parse(
        account_id: &str,
        region: &str,
        pillar: Option<&str>,
    ) -> Result<Self, ValidationError> {
        Ok(Self {
            account_id: AccountId::parse(account_id)?,
            region: Region::parse(region)?,
            pillar: Pillar::parse_optional(pillar)?,
        })
    }
}

// =============================================================================
// Status and result attributes
// =============================================================================

/// Lifecycle status of a review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl ReviewStatus {
    pub const ALL: [ReviewStatus; 4] = [
        ReviewStatus::Pending,
        ReviewStatus::InProgress,
        ReviewStatus::Completed,
        ReviewStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    /// `COMPLETED` and `FAILED` end a processing attempt.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl FromStr for ReviewStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s.trim())
            .ok_or_else(|| ValidationError::Status(s.to_string()))
    }
}

impl fmt::Display for ReviewStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Four-level scale used for finding severity and recommendation priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Level {
    Low,
    Medium,
    High,
    Critical,
}

pub type Severity = Level;
pub type Priority = Level;

/// An issue surfaced by the review agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Finding {
    pub id: String,
    pub pillar: String,
    pub title: String,
    pub description: String,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_arn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
}

/// A suggested remediation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recommendation {
    pub id: String,
    pub title: String,
    pub description: String,
    pub priority: Priority,
    pub effort: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub implementation_guide: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub links: Option<Vec<String>>,
}

/// Structured result of a successful agent invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewOutcome {
    pub score: f64,
    #[serde(default)]
    pub findings: Vec<Finding>,
    #[serde(default)]
    pub recommendations: Vec<Recommendation>,
}

impl ReviewOutcome {
    /// Reject scores outside `[0, 100]`, including NaN and infinities.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.score.is_finite() && (0.0..=100.0).contains(&self.score) {
            Ok(())
        } else {
            Err(ValidationError::Score(self.score))
        }
    }
}

// =============================================================================
// Review record
// =============================================================================

/// The authoritative record of one review.
///
/// Result attributes are only populated while `status` is `COMPLETED`, and
/// `error_message` only while it is `FAILED`. The server's lifecycle module
/// is the only writer that changes `status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Review {
    pub review_id: ReviewId,
    /// Ordering key used for listing; equal to `created_at`.
    pub timestamp: DateTime<Utc>,
    pub status: ReviewStatus,
    pub aws_account_id: AccountId,
    pub region: Region,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pillar: Option<Pillar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub findings: Option<Vec<Finding>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommendations: Option<Vec<Recommendation>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub version: u64,
}

impl Review {
    /// A freshly submitted review.
    pub fn new_pending(subject: ReviewSubject, now: DateTime<Utc>) -> Self {
        Self {
            review_id: ReviewId::new(),
            timestamp: now,
            status: ReviewStatus::Pending,
            aws_account_id: subject.account_id,
            region: subject.region,
            pillar: subject.pillar,
            score: None,
            findings: None,
            recommendations: None,
            error_message: None,
            attempts: 0,
            claimed_at: None,
            created_at: now,
            updated_at: now,
            version: 1,
        }
    }

    pub fn subject(&self) -> ReviewSubject {
        ReviewSubject {
            account_id: self.aws_account_id.clone(),
            region: self.region.clone(),
            pillar: self.pillar,
        }
    }

    /// The result attributes, if all of them are present.
    pub fn outcome(&self) -> Option<ReviewOutcome> {
        match (&self.score, &self.findings, &self.recommendations) {
            (Some(score), Some(findings), Some(recommendations)) => Some(ReviewOutcome {
                score: *score,
                findings: findings.clone(),
                recommendations: recommendations.clone(),
            }),
            _ => None,
        }
    }

    pub fn has_result_attributes(&self) -> bool {
        self.score.is_some() || self.findings.is_some() || self.recommendations.is_some()
    }
}
