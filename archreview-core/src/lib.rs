pub mod agent;
pub mod correlation;
pub mod review;

pub use agent::{
    create_agent_client, parse_agent_response, AgentError, AgentRequest, HttpReviewAgent,
    ReviewAgent,
};
pub use correlation::{CorrelationId, CorrelationMiddleware, CORRELATION_ID_HEADER};
pub use review::*;
