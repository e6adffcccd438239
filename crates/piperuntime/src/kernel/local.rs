use super::script::{self, Namespace};
use super::{HandleState, Kernel, KernelHandle, KernelId};
use pipecore::{KernelError, RemoteError, Value, DEFAULT_LANGUAGE};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot::error::TryRecvError;
use tokio::sync::{mpsc, oneshot, watch};

enum Op {
    Push(BTreeMap<String, Value>),
    Bind(BTreeMap<String, String>),
    Execute(String),
    Pull(String),
}

struct Command {
    op: Op,
    reply: oneshot::Sender<Result<Option<Value>, RemoteError>>,
    stdout: watch::Sender<String>,
}

/// In-process kernel running the `script` language on a tokio task.
///
/// Calls are served strictly in submission order against one namespace.
pub struct LocalKernel {
    id: KernelId,
    commands: mpsc::UnboundedSender<Command>,
    depth: Arc<AtomicUsize>,
}

impl LocalKernel {
    /// Spawn the kernel task. Must be called within a tokio runtime.
    pub fn spawn(id: KernelId) -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();
        let depth = Arc::new(AtomicUsize::new(0));
        tokio::spawn(serve(id, receiver, Arc::clone(&depth)));
        tracing::debug!(%id, "local kernel started");
        Self {
            id,
            commands,
            depth,
        }
    }

    fn submit(&self, op: Op) -> Result<Box<dyn KernelHandle>, KernelError> {
        let (reply, receiver) = oneshot::channel();
        let (stdout, stdout_rx) = watch::channel(String::new());

        self.depth.fetch_add(1, Ordering::SeqCst);
        if self
            .commands
            .send(Command { op, reply, stdout })
            .is_err()
        {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            return Err(KernelError::Disconnected);
        }

        Ok(Box::new(LocalHandle {
            reply: receiver,
            stdout: stdout_rx,
        }))
    }
}

impl Kernel for LocalKernel {
    fn id(&self) -> KernelId {
        self.id
    }

    fn setup_language(&mut self, language: &str) -> Result<(), KernelError> {
        if language == DEFAULT_LANGUAGE {
            Ok(())
        } else {
            Err(KernelError::Unavailable(language.to_string()))
        }
    }

    fn push(
        &mut self,
        vars: BTreeMap<String, Value>,
    ) -> Result<Box<dyn KernelHandle>, KernelError> {
        self.submit(Op::Push(vars))
    }

    fn bind(
        &mut self,
        aliases: BTreeMap<String, String>,
    ) -> Result<Box<dyn KernelHandle>, KernelError> {
        self.submit(Op::Bind(aliases))
    }

    fn execute(&mut self, code: &str) -> Result<Box<dyn KernelHandle>, KernelError> {
        self.submit(Op::Execute(code.to_string()))
    }

    fn pull(&mut self, name: &str) -> Result<Box<dyn KernelHandle>, KernelError> {
        self.submit(Op::Pull(name.to_string()))
    }

    fn queue_depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }
}

async fn serve(
    id: KernelId,
    mut receiver: mpsc::UnboundedReceiver<Command>,
    depth: Arc<AtomicUsize>,
) {
    let mut namespace = Namespace::new();

    while let Some(command) = receiver.recv().await {
        let result = match command.op {
            Op::Push(vars) => {
                namespace.extend(vars);
                Ok(None)
            }
            Op::Bind(aliases) => bind(&mut namespace, aliases),
            Op::Execute(code) => script::run(&code, &mut namespace, &command.stdout)
                .await
                .map(|_| None),
            Op::Pull(name) => namespace
                .get(&name)
                .cloned()
                .map(Some)
                .ok_or_else(|| RemoteError::new("NameError", format!("name '{}' is not defined", name))),
        };

        depth.fetch_sub(1, Ordering::SeqCst);
        // The runner may have abandoned this handle after an earlier failure.
        let _ = command.reply.send(result);
    }

    tracing::debug!(%id, "local kernel stopped");
}

fn bind(
    namespace: &mut Namespace,
    aliases: BTreeMap<String, String>,
) -> Result<Option<Value>, RemoteError> {
    for (alias, source) in aliases {
        let value = namespace.get(&source).cloned().ok_or_else(|| {
            RemoteError::new("NameError", format!("name '{}' is not defined", source))
        })?;
        namespace.insert(alias, value);
    }
    Ok(None)
}

struct LocalHandle {
    reply: oneshot::Receiver<Result<Option<Value>, RemoteError>>,
    stdout: watch::Receiver<String>,
}

impl KernelHandle for LocalHandle {
    fn poll(&mut self) -> HandleState {
        match self.reply.try_recv() {
            Ok(Ok(value)) => HandleState::Ready(value),
            Ok(Err(err)) => HandleState::Failed(err),
            Err(TryRecvError::Empty) => HandleState::Pending,
            Err(TryRecvError::Closed) => {
                HandleState::Failed(RemoteError::new("KernelDied", "kernel stopped before replying"))
            }
        }
    }

    fn stdout(&self) -> String {
        self.stdout.borrow().clone()
    }
}
