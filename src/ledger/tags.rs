//! Tag vocabulary shared by every marketplace participant.
//!
//! Names and values are case-sensitive; the indexer matches them verbatim.

pub const APP_NAME: &str = "App-Name";
pub const APP_VERSION: &str = "App-Version";
pub const CONTENT_TYPE: &str = "Content-Type";
pub const UNIX_TIME: &str = "Unix-Time";
pub const OPERATION_NAME: &str = "Operation-Name";
pub const SCRIPT_CURATOR: &str = "Script-Curator";
pub const SCRIPT_NAME: &str = "Script-Name";
pub const SCRIPT_OPERATOR: &str = "Script-Operator";
pub const SCRIPT_USER: &str = "Script-User";
pub const SCRIPT_FEE: &str = "Script-Fee";
pub const OPERATOR_FEE: &str = "Operator-Fee";
pub const REQUEST_TRANSACTION: &str = "Request-Transaction";
pub const RESPONSE_TRANSACTION: &str = "Response-Transaction";
pub const INFERENCE_TRANSACTION: &str = "Inference-Transaction";
pub const REGISTRATION_TRANSACTION: &str = "Registration-Transaction";
pub const CONVERSATION_IDENTIFIER: &str = "Conversation-Identifier";
pub const PAYMENT_QUANTITY: &str = "Payment-Quantity";
pub const PAYMENT_TARGET: &str = "Payment-Target";
pub const REQUEST_TOKENS: &str = "Request-Tokens";
pub const RESPONSE_TOKENS: &str = "Response-Tokens";

/// Values of the `Operation-Name` tag.
pub mod operation {
    pub const OPERATOR_REGISTRATION: &str = "Operator Registration";
    pub const OPERATOR_CANCELLATION: &str = "Operator Cancellation";
    pub const SCRIPT_CREATION: &str = "Script Creation";
    pub const SCRIPT_FEE_UPDATE: &str = "Script Fee Update";
    pub const SCRIPT_FEE_PAYMENT: &str = "Script Fee Payment";
    pub const INFERENCE_REQUEST: &str = "Script Inference Request";
    pub const INFERENCE_PAYMENT: &str = "Inference Payment";
    pub const INFERENCE_RESPONSE: &str = "Script Inference Response";
    pub const FEE_REDISTRIBUTION: &str = "Fee Redistribution";
}
