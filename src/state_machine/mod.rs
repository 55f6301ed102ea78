/// The [`StateMachine`] trait separates deterministic state transitions from the I/O that drives
/// them.
///
/// # Functionality
/// A state machine consumes [`Input`](StateMachine::Input) values and queues
/// [`Output`](StateMachine::Output) values describing what its owner must do next. The owner
/// performs that work (talking to a broker, spawning tasks) and feeds the results back as
/// further input.
///
/// Inputs and outputs are usually enums, one variant per kind of event or action. The trait only
/// fixes the calling convention so that every machine is driven the same way:
/// [`process_input`](StateMachine::process_input) followed by
/// [`poll_output`](StateMachine::poll_output) until it returns `None`.
///
/// # Invariants
/// Implementors must stay pure:
///
/// - no interior mutability and no shared ownership (`Cell`, `Mutex`, `Arc`, ...); all mutation
///   goes through `&mut self`,
/// - no I/O, including reading the clock or system randomness; such values arrive as input,
/// - no threads, no async and no blocking.
///
/// Because of this a machine can be wrapped in a plain [`Mutex`](std::sync::Mutex) by its owner
/// and locked only for the duration of a transition, and its behavior can be tested exhaustively
/// without a runtime.
///
/// Logging is the one tolerated side effect, provided the machine never depends on its outcome.
///
/// # Example
/// ```ignore
/// pub struct Gate {
///     open: bool,
///     pending: Option<GateOutput>,
/// }
///
/// pub enum GateInput {
///     Open,
///     Close,
/// }
///
/// pub enum GateOutput {
///     Opened,
///     Closed,
/// }
///
/// impl StateMachine for Gate {
///     type Input = GateInput;
///     type Output = GateOutput;
///
///     fn process_input(&mut self, input: Self::Input) {
///         match input {
///             GateInput::Open if !self.open => {
///                 self.open = true;
///                 self.pending = Some(GateOutput::Opened);
///             }
///             GateInput::Close if self.open => {
///                 self.open = false;
///                 self.pending = Some(GateOutput::Closed);
///             }
///             _ => {}
///         }
///     }
///
///     fn poll_output(&mut self) -> Option<Self::Output> {
///         self.pending.take()
///     }
/// }
/// ```
pub trait StateMachine {
    /// The type of input that is [processed](StateMachine::process_input) by the state machine.
    type Input;
    /// The type of output that is [polled](StateMachine::poll_output) by the state machine.
    type Output;

    /// Process the provided `input` into the state machine.
    fn process_input(&mut self, input: Self::Input);

    /// Poll the state machine for output, returning the first available output if present.
    fn poll_output(&mut self) -> Option<Self::Output>;

    /// Process `input` and collect every output it produced.
    fn transition(&mut self, input: Self::Input) -> Vec<Self::Output> {
        self.process_input(input);
        std::iter::from_fn(|| self.poll_output()).collect()
    }
}
