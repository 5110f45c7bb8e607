//! LDAP result codes and the library error taxonomy.
//!
//! Result codes are the closed enumeration from RFC 4511 Appendix A. Codes
//! outside the known set are carried as [`ResultCode::Unknown`] rather than
//! rejected, so a response from a nonconforming peer still round-trips.

use thiserror::Error;

use crate::ber::DecodeError;

/// Convenience alias for Results using [`LdapError`].
pub type Result<T, E = LdapError> = std::result::Result<T, E>;

/// LDAP result code (RFC 4511 Appendix A).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultCode {
    Success,
    OperationsError,
    ProtocolError,
    TimeLimitExceeded,
    SizeLimitExceeded,
    CompareFalse,
    CompareTrue,
    AuthMethodNotSupported,
    StrongerAuthRequired,
    Referral,
    AdminLimitExceeded,
    UnavailableCriticalExtension,
    ConfidentialityRequired,
    SaslBindInProgress,
    NoSuchAttribute,
    UndefinedAttributeType,
    InappropriateMatching,
    ConstraintViolation,
    AttributeOrValueExists,
    InvalidAttributeSyntax,
    NoSuchObject,
    AliasProblem,
    InvalidDnSyntax,
    AliasDereferencingProblem,
    InappropriateAuthentication,
    InvalidCredentials,
    InsufficientAccessRights,
    Busy,
    Unavailable,
    UnwillingToPerform,
    LoopDetect,
    NamingViolation,
    ObjectClassViolation,
    NotAllowedOnNonLeaf,
    NotAllowedOnRdn,
    EntryAlreadyExists,
    ObjectClassModsProhibited,
    AffectsMultipleDsas,
    Other,
    /// A code outside the defined set, kept with its raw value.
    Unknown(u32),
}

impl ResultCode {
    /// The numeric value sent on the wire.
    pub fn code(self) -> u32 {
        match self {
            ResultCode::Success => 0,
            ResultCode::OperationsError => 1,
            ResultCode::ProtocolError => 2,
            ResultCode::TimeLimitExceeded => 3,
            ResultCode::SizeLimitExceeded => 4,
            ResultCode::CompareFalse => 5,
            ResultCode::CompareTrue => 6,
            ResultCode::AuthMethodNotSupported => 7,
            ResultCode::StrongerAuthRequired => 8,
            ResultCode::Referral => 10,
            ResultCode::AdminLimitExceeded => 11,
            ResultCode::UnavailableCriticalExtension => 12,
            ResultCode::ConfidentialityRequired => 13,
            ResultCode::SaslBindInProgress => 14,
            ResultCode::NoSuchAttribute => 16,
            ResultCode::UndefinedAttributeType => 17,
            ResultCode::InappropriateMatching => 18,
            ResultCode::ConstraintViolation => 19,
            ResultCode::AttributeOrValueExists => 20,
            ResultCode::InvalidAttributeSyntax => 21,
            ResultCode::NoSuchObject => 32,
            ResultCode::AliasProblem => 33,
            ResultCode::InvalidDnSyntax => 34,
            ResultCode::AliasDereferencingProblem => 36,
            ResultCode::InappropriateAuthentication => 48,
            ResultCode::InvalidCredentials => 49,
            ResultCode::InsufficientAccessRights => 50,
            ResultCode::Busy => 51,
            ResultCode::Unavailable => 52,
            ResultCode::UnwillingToPerform => 53,
            ResultCode::LoopDetect => 54,
            ResultCode::NamingViolation => 64,
            ResultCode::ObjectClassViolation => 65,
            ResultCode::NotAllowedOnNonLeaf => 66,
            ResultCode::NotAllowedOnRdn => 67,
            ResultCode::EntryAlreadyExists => 68,
            ResultCode::ObjectClassModsProhibited => 69,
            ResultCode::AffectsMultipleDsas => 71,
            ResultCode::Other => 80,
            ResultCode::Unknown(code) => code,
        }
    }

    /// Map a wire value back to a code. Values outside the defined set become
    /// [`ResultCode::Unknown`].
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => ResultCode::Success,
            1 => ResultCode::OperationsError,
            2 => ResultCode::ProtocolError,
            3 => ResultCode::TimeLimitExceeded,
            4 => ResultCode::SizeLimitExceeded,
            5 => ResultCode::CompareFalse,
            6 => ResultCode::CompareTrue,
            7 => ResultCode::AuthMethodNotSupported,
            8 => ResultCode::StrongerAuthRequired,
            10 => ResultCode::Referral,
            11 => ResultCode::AdminLimitExceeded,
            12 => ResultCode::UnavailableCriticalExtension,
            13 => ResultCode::ConfidentialityRequired,
            14 => ResultCode::SaslBindInProgress,
            16 => ResultCode::NoSuchAttribute,
            17 => ResultCode::UndefinedAttributeType,
            18 => ResultCode::InappropriateMatching,
            19 => ResultCode::ConstraintViolation,
            20 => ResultCode::AttributeOrValueExists,
            21 => ResultCode::InvalidAttributeSyntax,
            32 => ResultCode::NoSuchObject,
            33 => ResultCode::AliasProblem,
            34 => ResultCode::InvalidDnSyntax,
            36 => ResultCode::AliasDereferencingProblem,
            48 => ResultCode::InappropriateAuthentication,
            49 => ResultCode::InvalidCredentials,
            50 => ResultCode::InsufficientAccessRights,
            51 => ResultCode::Busy,
            52 => ResultCode::Unavailable,
            53 => ResultCode::UnwillingToPerform,
            54 => ResultCode::LoopDetect,
            64 => ResultCode::NamingViolation,
            65 => ResultCode::ObjectClassViolation,
            66 => ResultCode::NotAllowedOnNonLeaf,
            67 => ResultCode::NotAllowedOnRdn,
            68 => ResultCode::EntryAlreadyExists,
            69 => ResultCode::ObjectClassModsProhibited,
            71 => ResultCode::AffectsMultipleDsas,
            80 => ResultCode::Other,
            other => ResultCode::Unknown(other),
        }
    }

    /// The canonical lowerCamelCase name.
    pub fn name(self) -> &'static str {
        match self {
            ResultCode::Success => "success",
            ResultCode::OperationsError => "operationsError",
            ResultCode::ProtocolError => "protocolError",
            ResultCode::TimeLimitExceeded => "timeLimitExceeded",
            ResultCode::SizeLimitExceeded => "sizeLimitExceeded",
            ResultCode::CompareFalse => "compareFalse",
            ResultCode::CompareTrue => "compareTrue",
            ResultCode::AuthMethodNotSupported => "authMethodNotSupported",
            ResultCode::StrongerAuthRequired => "strongerAuthRequired",
            ResultCode::Referral => "referral",
            ResultCode::AdminLimitExceeded => "adminLimitExceeded",
            ResultCode::UnavailableCriticalExtension => "unavailableCriticalExtension",
            ResultCode::ConfidentialityRequired => "confidentialityRequired",
            ResultCode::SaslBindInProgress => "saslBindInProgress",
            ResultCode::NoSuchAttribute => "noSuchAttribute",
            ResultCode::UndefinedAttributeType => "undefinedAttributeType",
            ResultCode::InappropriateMatching => "inappropriateMatching",
            ResultCode::ConstraintViolation => "constraintViolation",
            ResultCode::AttributeOrValueExists => "attributeOrValueExists",
            ResultCode::InvalidAttributeSyntax => "invalidAttributeSyntax",
            ResultCode::NoSuchObject => "noSuchObject",
            ResultCode::AliasProblem => "aliasProblem",
            ResultCode::InvalidDnSyntax => "invalidDNSyntax",
            ResultCode::AliasDereferencingProblem => "aliasDereferencingProblem",
            ResultCode::InappropriateAuthentication => "inappropriateAuthentication",
            ResultCode::InvalidCredentials => "invalidCredentials",
            ResultCode::InsufficientAccessRights => "insufficientAccessRights",
            ResultCode::Busy => "busy",
            ResultCode::Unavailable => "unavailable",
            ResultCode::UnwillingToPerform => "unwillingToPerform",
            ResultCode::LoopDetect => "loopDetect",
            ResultCode::NamingViolation => "namingViolation",
            ResultCode::ObjectClassViolation => "objectClassViolation",
            ResultCode::NotAllowedOnNonLeaf => "notAllowedOnNonLeaf",
            ResultCode::NotAllowedOnRdn => "notAllowedOnRDN",
            ResultCode::EntryAlreadyExists => "entryAlreadyExists",
            ResultCode::ObjectClassModsProhibited => "objectClassModsProhibited",
            ResultCode::AffectsMultipleDsas => "affectsMultipleDSAs",
            ResultCode::Other => "other",
            ResultCode::Unknown(_) => "unknown",
        }
    }

    pub fn is_success(self) -> bool {
        self == ResultCode::Success
    }
}

impl std::fmt::Display for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResultCode::Unknown(code) => write!(f, "unknown({})", code),
            other => f.write_str(other.name()),
        }
    }
}

/// Top-level library errors.
///
/// Decode errors are separate from operation failures: an
/// [`DecodeError::InsufficientData`] is recoverable (retry with more bytes),
/// everything else in that family is fatal for the buffer position it was
/// raised at. Operation failures carry a [`ResultCode`]; connection errors
/// mean no transport is available for the attempted operation.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LdapError {
    /// BER-level decode failure.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// The peer answered with a non-success result code.
    #[error("{}: {message}", .code.name())]
    Result { code: ResultCode, message: String },

    /// Operation attempted before a transport was established.
    #[error("not connected")]
    NotConnected,

    /// The transport went away with the operation still pending.
    #[error("connection lost")]
    ConnectionLost,

    /// StartTLS was requested while other requests were outstanding.
    #[error("cannot start TLS while requests are outstanding")]
    StartTlsBusy,

    /// Well-formed BER that does not have the shape of a valid LDAP PDU, or a
    /// response stream that violates the protocol (e.g. an answer for an
    /// unknown message id).
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// I/O error on the underlying transport.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl LdapError {
    /// Build an operation error from a raw wire code, via the single
    /// `resultCode -> error` lookup.
    pub fn from_result(code: u32, message: impl Into<String>) -> Self {
        LdapError::Result {
            code: ResultCode::from_code(code),
            message: message.into(),
        }
    }

    /// The result code, for errors that carry one.
    pub fn result_code(&self) -> Option<ResultCode> {
        match self {
            LdapError::Result { code, .. } => Some(*code),
            _ => None,
        }
    }
}
