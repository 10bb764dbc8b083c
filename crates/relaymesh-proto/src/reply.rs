//! The reply-state sub-machine: tracks a backend's response to a single
//! routed command packet-by-packet, per §4.2.

use std::collections::HashMap;

use relaymesh_wire::{
    is_auth_switch_request, is_eof_packet, is_err_packet, is_local_infile, is_ok_packet,
    PayloadReader,
};

use crate::capabilities::{SERVER_MORE_RESULTS_EXIST, SERVER_SESSION_STATE_CHANGED};
use crate::command::Command;
use crate::error::{ProtoError, ProtoResult};

/// Where the reply-state machine currently is within one logical
/// response to a routed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyState {
    Start,
    RsetColDef { remaining: u64 },
    RsetColDefEof { opening_cursor: bool },
    RsetRows,
    RsetPrepare { remaining: u32 },
    Done,
}

/// A backend-reported error, parsed from an ERR packet.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BackendError {
    pub code: u16,
    pub sqlstate: String,
    pub message: String,
}

/// Everything collected while tracking one response.
#[derive(Debug, Clone, Default)]
pub struct ReplyMeta {
    pub command: u8,
    pub rows: u64,
    pub fields: u64,
    pub warnings: u16,
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: u16,
    pub set_vars: HashMap<String, String>,
    pub error: Option<BackendError>,
    /// `COM_STMT_PREPARE` response fields.
    pub generated_id: u32,
    pub param_count: u16,
    pub load_active: bool,
}

/// Drives [`ReplyState`] forward one complete packet at a time.
pub struct ReplyTracker {
    state: ReplyState,
    meta: ReplyMeta,
    changing_user: bool,
    session_track_capable: bool,
    opening_cursor: bool,
}

impl ReplyTracker {
    pub fn new(session_track_capable: bool) -> Self {
        Self {
            state: ReplyState::Done,
            meta: ReplyMeta::default(),
            changing_user: false,
            session_track_capable,
            opening_cursor: false,
        }
    }

    pub fn state(&self) -> &ReplyState {
        &self.state
    }

    pub fn meta(&self) -> &ReplyMeta {
        &self.meta
    }

    pub fn is_done(&self) -> bool {
        self.state == ReplyState::Done
    }

    pub fn set_changing_user(&mut self, changing_user: bool) {
        self.changing_user = changing_user;
    }

    /// Begin tracking a fresh response to `command`.
    pub fn begin(&mut self, command: Command) {
        self.meta = ReplyMeta::default();
        self.opening_cursor = matches!(command, Command::StmtExecute { opening_cursor: true });
        self.meta.command = match command {
            Command::StmtPrepare => crate::command::COM_STMT_PREPARE,
            Command::StmtExecute { .. } => crate::command::COM_STMT_EXECUTE,
            Command::BinlogDump => crate::command::COM_BINLOG_DUMP,
            Command::Statistics => crate::command::COM_STATISTICS,
            Command::FieldList => crate::command::COM_FIELD_LIST,
            Command::Other(b) => b,
        };
        self.state = if matches!(command, Command::FieldList) {
            ReplyState::RsetRows
        } else {
            ReplyState::Start
        };
    }

    /// Feed one already-framed, non-continuation packet payload through
    /// the state machine.
    pub fn process_one_packet(&mut self, payload: &[u8], command: Command) -> ProtoResult<()> {
        match &self.state {
            ReplyState::Start => self.process_start(payload, command),
            ReplyState::RsetColDef { remaining } => {
                let remaining = *remaining;
                self.process_col_def(remaining)
            }
            ReplyState::RsetColDefEof { opening_cursor } => {
                let opening_cursor = *opening_cursor;
                self.process_col_def_eof(opening_cursor)
            }
            ReplyState::RsetRows => self.process_rows(payload),
            ReplyState::RsetPrepare { remaining } => {
                let remaining = *remaining;
                self.process_prepare(remaining)
            }
            ReplyState::Done => self.process_done(payload),
        }
    }

    fn process_start(&mut self, payload: &[u8], command: Command) -> ProtoResult<()> {
        if matches!(command, Command::BinlogDump) {
            return Ok(());
        }
        if matches!(command, Command::Statistics) {
            self.state = ReplyState::Done;
            return Ok(());
        }

        if payload.is_empty() {
            return Err(ProtoError::BadPacket("empty reply payload".into()));
        }

        if is_err_packet(payload) {
            self.meta.error = Some(parse_err_packet(payload)?);
            self.state = ReplyState::Done;
            return Ok(());
        }

        if is_ok_packet(payload) {
            return self.process_ok(payload, command);
        }

        if is_local_infile(payload) {
            self.meta.load_active = true;
            self.state = ReplyState::Done;
            return Ok(());
        }

        if is_auth_switch_request(payload) && self.changing_user {
            // AuthSwitchRequest machinery is handled by the outer state
            // machine; the reply tracker has nothing further to do here.
            return Ok(());
        }

        // Otherwise this is the length-encoded column-count header.
        let mut r = PayloadReader::new(payload);
        let field_count = r.lenenc_int()?;
        self.meta.fields = field_count;
        self.state = ReplyState::RsetColDef {
            remaining: field_count,
        };
        Ok(())
    }

    fn process_ok(&mut self, payload: &[u8], command: Command) -> ProtoResult<()> {
        let mut r = PayloadReader::new(payload);
        let _header = r.u8()?; // 0x00
        self.meta.affected_rows = r.lenenc_int()?;
        self.meta.last_insert_id = r.lenenc_int()?;
        let status = r.u16_le()?;
        let warnings = r.u16_le()?;
        self.meta.status_flags = status;
        self.meta.warnings = warnings;

        if self.session_track_capable && status & SERVER_SESSION_STATE_CHANGED != 0 && !r.is_empty()
        {
            let info = r.lenenc_str()?;
            parse_session_track(info, &mut self.meta.set_vars);
        }

        if matches!(command, Command::StmtPrepare) {
            // PS OK response actually carries stmt_id/n_cols/n_params in
            // place of affected_rows/last_insert_id; reparse from the
            // start for this variant.
            let mut r2 = PayloadReader::new(payload);
            let _header = r2.u8()?;
            let stmt_id = r2.u32_le()?;
            let n_cols = r2.u16_le()?;
            let n_params = r2.u16_le()?;
            let _filler = r2.u8()?;
            let warnings = r2.u16_le().unwrap_or(0);
            self.meta.generated_id = stmt_id;
            self.meta.param_count = n_params;
            self.meta.fields = n_cols as u64;
            self.meta.warnings = warnings;

            let mut remaining = n_cols as u32 + n_params as u32;
            if n_params > 0 {
                remaining += 1;
            }
            if n_cols > 0 {
                remaining += 1;
            }
            self.state = ReplyState::RsetPrepare { remaining };
            return Ok(());
        }

        self.state = if status & SERVER_MORE_RESULTS_EXIST != 0 {
            ReplyState::Start
        } else {
            ReplyState::Done
        };
        Ok(())
    }

    fn process_col_def(&mut self, remaining: u64) -> ProtoResult<()> {
        let remaining = remaining.saturating_sub(1);
        self.state = if remaining == 0 {
            ReplyState::RsetColDefEof {
                opening_cursor: self.opening_cursor,
            }
        } else {
            ReplyState::RsetColDef { remaining }
        };
        Ok(())
    }

    fn process_col_def_eof(&mut self, opening_cursor: bool) -> ProtoResult<()> {
        self.state = if opening_cursor {
            ReplyState::Done
        } else {
            ReplyState::RsetRows
        };
        Ok(())
    }

    fn process_rows(&mut self, payload: &[u8]) -> ProtoResult<()> {
        if is_err_packet(payload) {
            self.meta.error = Some(parse_err_packet(payload)?);
            self.state = ReplyState::Done;
            return Ok(());
        }
        if is_eof_packet(payload) {
            let mut r = PayloadReader::new(payload);
            let _header = r.u8()?;
            let warnings = r.u16_le().unwrap_or(0);
            let status = r.u16_le().unwrap_or(0);
            self.meta.warnings = warnings;
            self.meta.status_flags = status;
            self.state = if status & SERVER_MORE_RESULTS_EXIST != 0 {
                ReplyState::Start
            } else {
                ReplyState::Done
            };
            return Ok(());
        }
        self.meta.rows += 1;
        Ok(())
    }

    fn process_prepare(&mut self, remaining: u32) -> ProtoResult<()> {
        let remaining = remaining.saturating_sub(1);
        self.state = if remaining == 0 {
            ReplyState::Done
        } else {
            ReplyState::RsetPrepare { remaining }
        };
        Ok(())
    }

    fn process_done(&mut self, payload: &[u8]) -> ProtoResult<()> {
        if is_err_packet(payload) {
            self.meta.error = Some(parse_err_packet(payload)?);
        }
        Ok(())
    }
}

fn parse_err_packet(payload: &[u8]) -> ProtoResult<BackendError> {
    let mut r = PayloadReader::new(payload);
    let _header = r.u8()?;
    let code = r.u16_le()?;
    let marker = r.u8().unwrap_or(b'#');
    let (sqlstate, message) = if marker == b'#' {
        let sqlstate = String::from_utf8_lossy(r.fixed(5)?).into_owned();
        let message = String::from_utf8_lossy(r.rest()).into_owned();
        (sqlstate, message)
    } else {
        // Pre-4.1 servers omit the SQLSTATE marker entirely.
        let mut rest = vec![marker];
        rest.extend_from_slice(r.rest());
        (String::new(), String::from_utf8_lossy(&rest).into_owned())
    };
    Ok(BackendError {
        code,
        sqlstate,
        message,
    })
}

/// Parse the recognised subset of session-track blocks following an
/// OK-packet's warnings field: repeated `(type u8, lenenc data)` blocks,
/// where type 0 (SESSION_TRACK_SYSTEM_VARIABLES) carries lenenc
/// name/value pairs. Other block types are skipped but still consumed
/// so the cursor stays aligned.
fn parse_session_track(info: &[u8], set_vars: &mut HashMap<String, String>) {
    let mut r = PayloadReader::new(info);
    while !r.is_empty() {
        let Ok(block_type) = r.u8() else { break };
        let Ok(block_data) = r.lenenc_str() else {
            break;
        };
        if block_type == 0 {
            let mut br = PayloadReader::new(block_data);
            while !br.is_empty() {
                let (Ok(name), Ok(value)) = (br.lenenc_str(), br.lenenc_str()) else {
                    break;
                };
                set_vars.insert(
                    String::from_utf8_lossy(name).into_owned(),
                    String::from_utf8_lossy(value).into_owned(),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaymesh_wire::write_lenenc_int;

    fn ok_packet(affected: u64, last_id: u64, status: u16, warnings: u16) -> Vec<u8> {
        let mut p = vec![0x00];
        write_lenenc_int(&mut p, affected);
        write_lenenc_int(&mut p, last_id);
        p.extend_from_slice(&status.to_le_bytes());
        p.extend_from_slice(&warnings.to_le_bytes());
        p
    }

    fn err_packet(code: u16, sqlstate: &str, message: &str) -> Vec<u8> {
        let mut p = vec![0xff];
        p.extend_from_slice(&code.to_le_bytes());
        p.push(b'#');
        p.extend_from_slice(sqlstate.as_bytes());
        p.extend_from_slice(message.as_bytes());
        p
    }

    fn eof_packet(warnings: u16, status: u16) -> Vec<u8> {
        let mut p = vec![0xfe];
        p.extend_from_slice(&warnings.to_le_bytes());
        p.extend_from_slice(&status.to_le_bytes());
        p
    }

    fn col_count_packet(n: u64) -> Vec<u8> {
        let mut p = Vec::new();
        write_lenenc_int(&mut p, n);
        p
    }

    #[test]
    fn simple_select_walks_start_to_done() {
        let mut t = ReplyTracker::new(false);
        t.begin(Command::Other(crate::command::COM_QUERY));

        t.process_one_packet(&col_count_packet(1), Command::Other(3))
            .unwrap();
        assert_eq!(*t.state(), ReplyState::RsetColDef { remaining: 1 });

        t.process_one_packet(&[0u8; 10], Command::Other(3)).unwrap();
        assert_eq!(
            *t.state(),
            ReplyState::RsetColDefEof {
                opening_cursor: false
            }
        );

        t.process_one_packet(&eof_packet(0, 0), Command::Other(3))
            .unwrap();
        assert_eq!(*t.state(), ReplyState::RsetRows);

        t.process_one_packet(&[1, b'a'], Command::Other(3)).unwrap();
        assert_eq!(t.meta().rows, 1);

        t.process_one_packet(&eof_packet(0, 0x0002), Command::Other(3))
            .unwrap();
        assert_eq!(*t.state(), ReplyState::Done);
        assert_eq!(t.meta().rows, 1);
    }

    #[test]
    fn ok_packet_with_more_results_stays_start() {
        let mut t = ReplyTracker::new(false);
        t.begin(Command::Other(crate::command::COM_QUERY));
        t.process_one_packet(&ok_packet(0, 0, SERVER_MORE_RESULTS_EXIST, 0), Command::Other(3))
            .unwrap();
        assert_eq!(*t.state(), ReplyState::Start);
    }

    #[test]
    fn ok_packet_without_more_results_is_done() {
        let mut t = ReplyTracker::new(false);
        t.begin(Command::Other(crate::command::COM_QUERY));
        t.process_one_packet(&ok_packet(3, 7, 0x0002, 0), Command::Other(3))
            .unwrap();
        assert_eq!(*t.state(), ReplyState::Done);
        assert_eq!(t.meta().affected_rows, 3);
        assert_eq!(t.meta().last_insert_id, 7);
    }

    #[test]
    fn err_packet_is_recorded_and_done() {
        let mut t = ReplyTracker::new(false);
        t.begin(Command::Other(crate::command::COM_QUERY));
        t.process_one_packet(
            &err_packet(1045, "28000", "Access denied"),
            Command::Other(3),
        )
        .unwrap();
        assert_eq!(*t.state(), ReplyState::Done);
        let err = t.meta().error.clone().unwrap();
        assert_eq!(err.code, 1045);
        assert_eq!(err.sqlstate, "28000");
        assert_eq!(err.message, "Access denied");
    }

    #[test]
    fn prepare_response_counts_params_and_cols() {
        let mut t = ReplyTracker::new(false);
        t.begin(Command::StmtPrepare);

        let mut ps_ok = vec![0x00];
        ps_ok.extend_from_slice(&17u32.to_le_bytes()); // stmt_id
        ps_ok.extend_from_slice(&1u16.to_le_bytes()); // n_cols
        ps_ok.extend_from_slice(&1u16.to_le_bytes()); // n_params
        ps_ok.push(0); // filler
        ps_ok.extend_from_slice(&0u16.to_le_bytes()); // warnings

        t.process_one_packet(&ps_ok, Command::StmtPrepare).unwrap();
        assert_eq!(t.meta().generated_id, 17);
        assert_eq!(t.meta().param_count, 1);
        assert_eq!(*t.state(), ReplyState::RsetPrepare { remaining: 4 });

        for _ in 0..3 {
            t.process_one_packet(&[0u8; 4], Command::StmtPrepare).unwrap();
        }
        assert_ne!(*t.state(), ReplyState::Done);
        t.process_one_packet(&[0u8; 4], Command::StmtPrepare).unwrap();
        assert_eq!(*t.state(), ReplyState::Done);
    }

    #[test]
    fn local_infile_marks_load_active() {
        let mut t = ReplyTracker::new(false);
        t.begin(Command::Other(crate::command::COM_QUERY));
        t.process_one_packet(&[0xfb, b'/', b'p'], Command::Other(3))
            .unwrap();
        assert!(t.meta().load_active);
        assert_eq!(*t.state(), ReplyState::Done);
    }

    #[test]
    fn field_list_skips_straight_to_rows() {
        let mut t = ReplyTracker::new(false);
        t.begin(Command::FieldList);
        assert_eq!(*t.state(), ReplyState::RsetRows);
    }

    #[test]
    fn cursor_open_ends_at_col_def_eof() {
        let mut t = ReplyTracker::new(false);
        t.begin(Command::StmtExecute {
            opening_cursor: true,
        });
        t.process_one_packet(&col_count_packet(1), Command::StmtExecute { opening_cursor: true })
            .unwrap();
        t.process_one_packet(&[0u8; 4], Command::StmtExecute { opening_cursor: true })
            .unwrap();
        assert_eq!(
            *t.state(),
            ReplyState::RsetColDefEof {
                opening_cursor: true
            }
        );
        t.process_one_packet(&eof_packet(0, 0), Command::StmtExecute { opening_cursor: true })
            .unwrap();
        assert_eq!(*t.state(), ReplyState::Done);
    }

    #[test]
    fn done_state_records_out_of_band_error() {
        let mut t = ReplyTracker::new(false);
        t.begin(Command::Other(crate::command::COM_QUERY));
        t.process_one_packet(&ok_packet(0, 0, 0x0002, 0), Command::Other(3))
            .unwrap();
        assert_eq!(*t.state(), ReplyState::Done);
        t.process_one_packet(&err_packet(2013, "HY000", "lost"), Command::Other(3))
            .unwrap();
        assert_eq!(*t.state(), ReplyState::Done);
        assert_eq!(t.meta().error.as_ref().unwrap().code, 2013);
    }

    #[test]
    fn session_track_system_variables_are_parsed() {
        let mut set_vars = HashMap::new();
        let mut name_value = Vec::new();
        relaymesh_wire::write_lenenc_str(&mut name_value, b"autocommit");
        relaymesh_wire::write_lenenc_str(&mut name_value, b"ON");
        let mut block = vec![0u8]; // type 0
        relaymesh_wire::write_lenenc_str(&mut block, &name_value);
        parse_session_track(&block, &mut set_vars);
        assert_eq!(set_vars.get("autocommit").map(String::as_str), Some("ON"));
    }
}
