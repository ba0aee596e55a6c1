//! Line protocol handling and command execution

use std::{ io, marker::PhantomData, time::Duration };
use tokio::io::{ AsyncWriteExt, AsyncReadExt };

use crate::{
    cmd::{ CmdSet, CmdDisplayFactory },
    error::InstrumentError,
    reply::parse_decimal,
};

/// How long a query waits for its reply before the reading is given up
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_millis(2000);

pub(crate) struct Executor<T, D>
{
    line_ending: &'static str,
    io_handle: T,
    read_buf: Vec<u8>,
    timeout: Duration,
    // This marker exists so we can use a generic in order to know which serialization delegate to
    // use at compile time. Constructing an `fmt::Display` implementor for a command is a purely
    // functional operation, so there is no actual data or state to store
    _cmd_serializer: PhantomData<D>,
}

impl <T, D> Executor<T, D>
    where T: AsyncReadExt + AsyncWriteExt + Unpin + Send,
          D: CmdDisplayFactory
{
    pub fn with(line_ending: &'static str, io_handle: T) -> Self
    {
        Self {
            line_ending: line_ending,
            io_handle: io_handle,
            read_buf: Vec::with_capacity(128),
            timeout: DEFAULT_QUERY_TIMEOUT,
            _cmd_serializer: PhantomData,
        }
    }

    pub fn set_timeout(&mut self, timeout: Duration)
    {
        self.timeout = timeout;
    }

    /// Gives the I/O stream back, discarding anything still buffered
    pub fn into_inner(self) -> T
    {
        self.io_handle
    }

    /// Drops the first `n` bytes from the read buffer
    ///
    /// Drops all bytes if `n >= self.read_buf.len()`
    fn drop_first(&mut self, n: usize)
    {
        if n >= self.read_buf.len() {
            self.read_buf.clear();
        }
        else {
            // relocate any bytes after the Nth byte to index 0
            self.read_buf.rotate_left(n);
            // chop off the bytes we just consumed
            self.read_buf.truncate(self.read_buf.len() - n);
            // shrink the buffer's allocation to keep memory usage down
            self.read_buf.shrink_to(128);
        }
    }

    /// Returns the index of the first linefeed in the read buffer, if any, starting the search at
    /// the suggested index
    fn find_line_ending(&self, start_hint: usize) -> Option<usize>
    {
        self.read_buf
            .iter()
            .skip(start_hint)
            .position(|byte| *byte == 0x0A)
            .map(|offset| start_hint + offset)
    }

    /// Reads a line (series of bytes terminated by `LF` / 0x0A) into the read buffer and returns
    /// how many bytes are in the line, terminator included
    ///
    /// # Cancel Safety
    /// This function is cancel safe e.g. when wrapped in `tokio::time::timeout`. It never destroys
    /// contents of the read buffer -- only appends.
    async fn read_line(&mut self) -> Result<usize, io::Error>
    {
        // try to find the ending in already-buffered data first
        let mut end_index = self.find_line_ending(0);

        while end_index.is_none() {
            let mut temp_buf = [0u8; 64];
            let bytes_read = self.io_handle.read(&mut temp_buf[..]).await?;

            if bytes_read == 0 {
                return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
            }

            let prior_len = self.read_buf.len();
            self.read_buf.extend_from_slice(&temp_buf[..bytes_read]);
            end_index = self.find_line_ending(prior_len);
        }

        Ok(end_index.map_or(0, |index| index + 1))
    }

    /// Removes a line of `size` bytes from the read buffer and decodes it without its line ending
    fn take_string(&mut self, size: usize) -> Result<String, std::string::FromUtf8Error>
    {
        let line = self.read_buf[..size].to_vec();
        self.drop_first(size);

        let mut response = String::from_utf8(line)?;
        let trimmed_len = response.trim_end_matches(['\r', '\n']).len();
        response.truncate(trimmed_len);

        Ok(response)
    }

    /// Sends the given command. SCPI devices do not acknowledge writes, so success only means the
    /// bytes were handed to the stream.
    pub async fn exec_cmd(&mut self, cmd: CmdSet) -> Result<(), InstrumentError>
    {
        let serialized = format!("{}{}", D::display_cmd(cmd), self.line_ending);
        self.io_handle.write_all(serialized.as_bytes()).await?;
        self.io_handle.flush().await?;

        Ok(())
    }

    /// Sends a query and returns the reply line
    ///
    /// Any bytes left over from an earlier exchange (e.g. a reply which arrived after its query had
    /// already timed out) are thrown away first so they are not mistaken for this reply.
    pub async fn query(&mut self, cmd: CmdSet) -> Result<String, InstrumentError>
    {
        if !self.read_buf.is_empty() {
            log::debug!("discarding {} stale bytes before query", self.read_buf.len());
            self.read_buf.clear();
        }

        self.exec_cmd(cmd).await?;

        let response_len = tokio::time::timeout(self.timeout, self.read_line())
            .await
            .map_err(|_| InstrumentError::Timeout(self.timeout))??;

        Ok(self.take_string(response_len)?)
    }

    pub async fn query_f64(&mut self, cmd: CmdSet) -> Result<f64, InstrumentError>
    {
        let reply = self.query(cmd).await?;
        Ok(parse_decimal(&reply)?)
    }
}
