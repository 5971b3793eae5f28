pub mod arbiter;
pub mod pending;
pub mod risk;
pub mod server;

pub use arbiter::{
    Answer, ApprovalRequest, CommercePermissionRequest, FilePermissionRequest, LateAnswer,
    PermissionArbiter, PermissionDecision, QuestionRequest,
};
pub use pending::ResolveOutcome;
pub use risk::{classify, FileOperation, RiskLevel};
pub use server::ApprovalServers;
