use kubernetes::{DynamicObject, EventHandler, HandlerError};
use tracing::info;

/// Writes one log line per observed change.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogHandler;

impl EventHandler for LogHandler {
    fn on_add(&self, obj: &DynamicObject) -> Result<(), HandlerError> {
        info!(
            message = "received add event!",
            name = obj.name(),
            namespace = obj.namespace().unwrap_or_default(),
            labels = ?obj.labels(),
        );

        Ok(())
    }

    fn on_update(&self, old: &DynamicObject, new: &DynamicObject) -> Result<(), HandlerError> {
        info!(
            message = "received update event!",
            name = new.name(),
            namespace = new.namespace().unwrap_or_default(),
            labels = ?new.labels(),
            old_resource_version = old.resource_version().unwrap_or_default(),
            resource_version = new.resource_version().unwrap_or_default(),
        );

        Ok(())
    }

    fn on_delete(&self, obj: &DynamicObject) -> Result<(), HandlerError> {
        info!(
            message = "received delete event!",
            name = obj.name(),
            namespace = obj.namespace().unwrap_or_default(),
            labels = ?obj.labels(),
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::Arc;

    use kubernetes::testing::object_with_labels;
    use parking_lot::Mutex;

    use super::*;

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl Write for Capture {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn capture(f: impl FnOnce()) -> Vec<String> {
        let buf = Capture::default();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_writer({
                let buf = buf.clone();
                move || buf.clone()
            })
            .finish();

        tracing::subscriber::with_default(subscriber, f);

        let output = String::from_utf8(buf.0.lock().clone()).unwrap();
        output.lines().map(str::to_string).collect()
    }

    #[test]
    fn distinct_messages() {
        let old = object_with_labels("default", "web", "1", &[("app", "web")]);
        let new = object_with_labels("default", "web", "2", &[("app", "web2")]);

        let lines = capture(|| {
            LogHandler.on_add(&old).unwrap();
            LogHandler.on_update(&old, &new).unwrap();
            LogHandler.on_delete(&new).unwrap();
        });

        assert_eq!(lines.len(), 3);

        assert!(lines[0].contains("received add event!"), "{}", lines[0]);
        assert!(lines[0].contains("name=\"web\""), "{}", lines[0]);
        assert!(lines[0].contains("namespace=\"default\""), "{}", lines[0]);
        assert!(lines[0].contains(r#"labels={"app": "web"}"#), "{}", lines[0]);

        assert!(lines[1].contains("received update event!"), "{}", lines[1]);
        assert!(lines[1].contains("old_resource_version=\"1\""), "{}", lines[1]);
        assert!(lines[1].contains("resource_version=\"2\""), "{}", lines[1]);
        assert!(lines[1].contains(r#"labels={"app": "web2"}"#), "{}", lines[1]);

        assert!(lines[2].contains("received delete event!"), "{}", lines[2]);
        assert!(lines[2].contains("name=\"web\""), "{}", lines[2]);
    }
}
