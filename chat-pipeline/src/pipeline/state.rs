use state_machines::state_machine;

state_machine! {
    name: ChatMachine,
    state: ChatState,
    initial: Received,
    states: [Received, Validated, ContextBuilt, Generating, Streaming, Buffering, Completed, Failed],
    events {
        validate { transition: { from: Received, to: Validated } }
        build_context { transition: { from: Validated, to: ContextBuilt } }
        start_generation { transition: { from: ContextBuilt, to: Generating } }
        start_streaming { transition: { from: Generating, to: Streaming } }
        start_buffering { transition: { from: Generating, to: Buffering } }
        finish {
            transition: { from: Streaming, to: Completed }
            transition: { from: Buffering, to: Completed }
        }
        abort {
            transition: { from: Received, to: Failed }
            transition: { from: Validated, to: Failed }
            transition: { from: ContextBuilt, to: Failed }
            transition: { from: Generating, to: Failed }
            transition: { from: Streaming, to: Failed }
            transition: { from: Buffering, to: Failed }
        }
    }
}

pub fn received() -> ChatMachine<(), Received> {
    ChatMachine::new(())
}
