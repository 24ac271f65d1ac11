pub mod interlock;
pub mod packml;
pub mod safety;
pub mod tags;
pub mod value;

pub use interlock::{
    ComparisonError, ComparisonOperator, InterlockBinding, InterlockEvaluator, InterlockPolicy,
    InterlockResult,
};
pub use packml::{
    AutoComplete, PackMlMachine, ProcedureCommand, ProcedureState, StateHook, Transition,
    TransitionError,
};
pub use safety::{parse_rate_string, RateLimitError, RateLimiter, SafetyController, WriteValidation};
pub use tags::{
    Quality, QualityCategory, ScaleConfig, ScaleError, SubscriptionId, TagDefinition, TagState,
    TagSubscriber, TagValue,
};
pub use value::{DataType, Value, ValueError};
