use tracing::{debug, trace};
use crate::connection::ConnectionInner;
use crate::error::SendError;
use crate::send_path::Admission;

impl ConnectionInner {
    /// Retries everything that was held back, in protocol order: queued control messages,
    ///  then queued data, then the completion for a half used sink advertisement, then a
    ///  pending disconnect. A queue stops at its first refusal, so nothing overtakes a
    ///  buffer that is waiting. Only fatal errors cut the later steps short; other errors are
    ///  returned once all steps ran.
    pub(crate) fn flush(&mut self) -> Result<(), SendError> {
        let mut refused = None;

        while let Some(buffer) = self.ctrl_queue.take_head() {
            match self.admit_control(buffer) {
                Admission::Posted => {}
                Admission::Buffered(buffer, reason) => {
                    trace!("control queue stalled: {:?}", reason);
                    self.ctrl_queue.put_head(buffer);
                    break;
                }
                Admission::Failed { buffer, error } => {
                    if let Some(buffer) = buffer {
                        self.ctrl_queue.put_head(buffer);
                    }
                    if error.is_fatal() {
                        return Err(error);
                    }
                    debug!("control queue refused: {}", error);
                    refused = Some(error);
                    break;
                }
            }
        }

        // control messages must not be overtaken by data
        if self.ctrl_queue.is_empty() {
            while let Some(buffer) = self.data_queue.take_head() {
                match self.admit_data(buffer) {
                    Admission::Posted => {}
                    Admission::Buffered(buffer, reason) => {
                        trace!("data queue stalled: {:?}", reason);
                        self.data_queue.put_head(buffer);
                        break;
                    }
                    Admission::Failed { buffer, error } => {
                        if let Some(buffer) = buffer {
                            self.data_queue.put_head(buffer);
                        }
                        if error.is_fatal() {
                            return Err(error);
                        }
                        debug!("data queue refused: {}", error);
                        refused = Some(error);
                        break;
                    }
                }
            }
        }

        if self.data_queue.is_empty() && self.adverts.peek_active_advertisement().map(|a| a.posted > 0).unwrap_or(false) {
            debug!("send backlog is drained, reporting partially filled sink");
            self.retire_active_advertisement()?;
        }

        self.try_send_disconnect()?;

        if self.write_full && self.write_space(false) > 0 {
            self.write_full = false;
            self.wake_writers = true;
        }

        match refused {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}
