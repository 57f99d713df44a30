/// The [`StateMachine`] trait provides calling semantics and indicates the upholding of invariants
/// that guarantee deterministic behavior.
///
/// The stream engines ([`WriteMachine`](crate::stream::writer::WriteMachine) and
/// [`ReadMachine`](crate::stream::reader::ReadMachine)) are written against this trait. Their
/// containers own the machine behind a [`Mutex`](std::sync::Mutex), feed it inputs from the
/// calling thread and from completion notifications, then drain the outputs and perform the
/// transport operations they describe after the lock is released.
///
/// # Invariants
/// A [`StateMachine`] must be pure in that its operation does not depend on any external behavior
/// of the broader system.
///
/// ## No Interior Mutability
/// All data *must* either be immutable or provide mutability only through `&mut` access. Shared
/// ownership via [`Arc`](std::sync::Arc) is prohibited for the same reason: reference counts are
/// not pure.
///
/// Values that are only *carried* by the machine and handed back out through
/// [`Output`](StateMachine::Output) (outgoing messages, completion promises) are opaque payloads.
/// The machine never inspects or invokes them, so they do not affect its transitions.
///
/// ## No IO, Time, or Concurrency
/// No system IO, clock or entropy access, threads, async or blocking. Anything of that kind is
/// handled by the container and fed back in as input.
///
/// # Side Effects
/// Logging is the one allowed side effect, and the logic of the machine *must not* rely on its
/// outcome.
pub trait StateMachine {
    /// The type of input that is [processed](StateMachine::process_input) by the state machine.
    type Input;
    /// The type of output that is [polled](StateMachine::poll_output) by the state machine.
    type Output;

    /// Process the provided `input` into the state machine.
    fn process_input(&mut self, input: Self::Input);

    /// Poll the state machine for output, returning the first available output if present.
    fn poll_output(&mut self) -> Option<Self::Output>;
}
