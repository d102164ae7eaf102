use blockshell_terminal::Executor;
use blockshell_terminal::StreamOptions;
use tracing::debug;

use crate::store::BlockStore;

/// Run `command` on a PTY, appending its output to `block_id` as it arrives,
/// then complete the block with the exit code. Completion happens exactly
/// once and only after the last chunk has been appended.
pub fn execute_to_block(
    store: &BlockStore,
    executor: &Executor,
    block_id: &str,
    command: &str,
    options: &StreamOptions,
) -> i32 {
    debug!(block_id, command, cwd = %options.cwd, "Executing block");
    let exit_code = executor.execute_stream(
        command,
        options,
        |data| {
            store.append_output(block_id, data, "stdout");
        },
        |data| {
            store.append_output(block_id, data, "stderr");
        },
    );
    store.complete_block(block_id, exit_code);
    exit_code
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::BlockState;

    fn sh() -> StreamOptions {
        StreamOptions::default().with_shell("/bin/sh")
    }

    #[test]
    fn test_output_lands_in_block_before_completion() {
        let store = BlockStore::in_memory();
        let block = store.create_block("s", "echo hello", None);

        let code = execute_to_block(&store, &Executor::new(), &block, "echo hello", &sh());

        let b = store.get_block(&block).unwrap();
        assert_eq!(code, 0);
        assert_eq!(b.state, BlockState::Completed);
        let output: String = b.output_chunks.iter().map(|c| c.data.as_str()).collect();
        assert!(output.contains("hello"));
        assert!(b.output_chunks.iter().all(|c| c.kind == "stdout"));
    }

    #[test]
    fn test_nonzero_exit_marks_block_failed() {
        let store = BlockStore::in_memory();
        let block = store.create_block("s", "exit 3", None);

        assert_eq!(execute_to_block(&store, &Executor::new(), &block, "exit 3", &sh()), 3);
        let b = store.get_block(&block).unwrap();
        assert_eq!(b.state, BlockState::Failed);
        assert_eq!(b.exit_code, 3);
    }

    #[test]
    fn test_runs_in_given_directory() {
        let dir = tempfile::tempdir().unwrap();
        let cwd = dir.path().canonicalize().unwrap();
        let store = BlockStore::in_memory();
        let block = store.create_block("s", "pwd", None);

        let options = sh().with_cwd(cwd.to_string_lossy());
        execute_to_block(&store, &Executor::new(), &block, "pwd", &options);

        let output: String = store
            .get_block(&block)
            .unwrap()
            .output_chunks
            .iter()
            .map(|c| c.data.clone())
            .collect();
        assert!(output.contains(cwd.to_str().unwrap()));
    }
}
