mod flow_control;
mod state;
mod store;
mod stream;

pub use self::flow_control::{Credit, FlowError, RecvFlow, SendFlow};
pub use self::state::{transition, Direction, State, StreamState};
pub use self::store::{Counts, Store};
pub use self::stream::{
    CloseSignal, RecvBuffer, Stream, StreamInner, Transition, TransitionError,
};
