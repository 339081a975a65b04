//! Patient-mapping messages feed the mapping cache.

use std::cell::RefCell;
use std::rc::Rc;

use dwc_core::{Channel, Message};

use crate::db::DwcDb;
use crate::dispatch::{Decisions, Handler, HandlerError};

pub struct PatientMappingHandler {
    db: Rc<RefCell<DwcDb>>,
}

impl PatientMappingHandler {
    pub fn new(db: Rc<RefCell<DwcDb>>) -> PatientMappingHandler {
        PatientMappingHandler { db }
    }
}

impl Handler for PatientMappingHandler {
    fn name(&self) -> &'static str {
        "PatientMappingHandler"
    }

    fn send_message(
        &mut self,
        _channel: &Channel,
        msg: &Message,
        decisions: &mut Decisions,
        _ttl: i64,
    ) -> Result<(), HandlerError> {
        let Message::PatientMapping(m) = msg else {
            return Ok(());
        };
        decisions.nack();
        self.db
            .borrow_mut()
            .set_patient_id(m.mapping_id, m.patient_id);
        decisions.ack();
        Ok(())
    }

    fn flush(&mut self) -> Result<(), HandlerError> {
        Ok(())
    }
}
