use std::collections::HashMap;

use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError};

// ── Maintenance reports & workload balancing ──────────────
//
// Assignment is floor-scoped: a report for "2nd Floor" only ever goes
// to staff responsible for "2nd Floor". Among eligible staff the one with
// the fewest active (Pending or In Progress) reports wins; ties break by
// staff id ascending, which is deterministic and, with ULIDs, favors the
// longest-registered member.

impl Engine {
    pub async fn register_staff(
        &self,
        actor: &Actor,
        name: String,
        floor: String,
    ) -> Result<Ulid, EngineError> {
        if !actor.is_admin() {
            return Err(EngineError::Unauthorized {
                role: actor.role,
                action: "register staff",
            });
        }
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(EngineError::Validation("staff name length invalid"));
        }
        if floor.is_empty() || floor.len() > MAX_NAME_LEN {
            return Err(EngineError::Validation("floor label length invalid"));
        }
        if self.staff.len() >= MAX_STAFF_PER_CAMPUS {
            return Err(EngineError::LimitExceeded("too many staff"));
        }
        let id = Ulid::new();
        self.persist_directory(None, &Event::StaffRegistered { id, name, floor })
            .await?;
        tracing::info!(staff_id = %id, "staff registered");
        Ok(id)
    }

    /// Removing a staff member leaves their reports assigned; reassignment
    /// is an explicit operator action, not an automatic cascade.
    pub async fn remove_staff(&self, actor: &Actor, id: Ulid) -> Result<(), EngineError> {
        if !actor.is_admin() {
            return Err(EngineError::Unauthorized {
                role: actor.role,
                action: "remove staff",
            });
        }
        if !self.staff.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        self.persist_directory(None, &Event::StaffRemoved { id }).await
    }

    /// File a maintenance report and auto-assign it to the least-loaded
    /// staff member on the report's floor. When the floor has no staff the
    /// report stays unassigned with an explanatory note instead of failing —
    /// losing the report would be worse than leaving it unrouted.
    pub async fn file_report(
        &self,
        actor: &Actor,
        category: String,
        floor: String,
        room: String,
        details: String,
        now: Ms,
    ) -> Result<Report, EngineError> {
        let _ = actor; // any authenticated role may report a fault
        if category.is_empty() || category.len() > MAX_NAME_LEN {
            return Err(EngineError::Validation("category length invalid"));
        }
        if floor.is_empty() || floor.len() > MAX_NAME_LEN {
            return Err(EngineError::Validation("floor label length invalid"));
        }
        if room.len() > MAX_NAME_LEN {
            return Err(EngineError::Validation("room label length invalid"));
        }
        if details.len() > MAX_TEXT_LEN {
            return Err(EngineError::Validation("details too long"));
        }
        if self.reports.len() >= MAX_REPORTS_PER_CAMPUS {
            return Err(EngineError::LimitExceeded("too many reports"));
        }

        // Hold the assignment mutex across pick + persist so two concurrent
        // filings see each other's assignment.
        let _assign = self.assign_mu.lock().await;

        let assigned_to = self.least_loaded_staff(&floor);
        let note = if assigned_to.is_none() {
            Some(format!("no staff registered for {floor}"))
        } else {
            None
        };

        let report = Report {
            id: Ulid::new(),
            category,
            floor,
            room,
            details,
            status: ReportStatus::Pending,
            assigned_to,
            note,
            created_at: now,
            resolved_at: None,
            action_taken: None,
        };
        self.persist_directory(assigned_to, &Event::ReportFiled { report: report.clone() })
            .await?;
        tracing::debug!(report_id = %report.id, assigned = ?report.assigned_to, "report filed");
        Ok(report)
    }

    /// Least-loaded eligible staff member for `floor`. One pass over the
    /// report ledger builds the per-staff active counts; candidates are then
    /// scanned in id order so ties resolve deterministically.
    fn least_loaded_staff(&self, floor: &str) -> Option<Ulid> {
        let mut candidates: Vec<Ulid> = self
            .staff
            .iter()
            .filter(|e| e.value().floor == floor)
            .map(|e| *e.key())
            .collect();
        if candidates.is_empty() {
            return None;
        }
        candidates.sort();

        let mut active: HashMap<Ulid, usize> = HashMap::new();
        for entry in self.reports.iter() {
            let r = entry.value();
            if r.is_active()
                && let Some(staff_id) = r.assigned_to {
                    *active.entry(staff_id).or_insert(0) += 1;
                }
        }

        let mut best: Option<(Ulid, usize)> = None;
        for id in candidates {
            let count = active.get(&id).copied().unwrap_or(0);
            // Strictly-less keeps the earliest id on ties.
            if best.is_none_or(|(_, c)| count < c) {
                best = Some((id, count));
            }
        }
        best.map(|(id, _)| id)
    }

    /// Manual (re)assignment. The target must cover the report's floor.
    pub async fn assign_report(
        &self,
        actor: &Actor,
        report_id: Ulid,
        staff_id: Ulid,
    ) -> Result<(), EngineError> {
        if !actor.is_operator() {
            return Err(EngineError::Unauthorized {
                role: actor.role,
                action: "assign reports",
            });
        }
        let _assign = self.assign_mu.lock().await;
        let report_floor = {
            let r = self.reports.get(&report_id).ok_or(EngineError::NotFound(report_id))?;
            if !r.is_active() {
                return Err(EngineError::Validation("report is no longer active"));
            }
            r.floor.clone()
        };
        let staff = self.staff.get(&staff_id).ok_or(EngineError::NotFound(staff_id))?;
        if staff.floor != report_floor {
            return Err(EngineError::Validation("staff member covers a different floor"));
        }
        drop(staff);
        self.persist_directory(
            Some(staff_id),
            &Event::ReportAssigned {
                id: report_id,
                staff_id,
            },
        )
        .await
    }

    pub async fn start_report(&self, actor: &Actor, report_id: Ulid) -> Result<(), EngineError> {
        if !actor.is_operator() {
            return Err(EngineError::Unauthorized {
                role: actor.role,
                action: "start reports",
            });
        }
        {
            let r = self.reports.get(&report_id).ok_or(EngineError::NotFound(report_id))?;
            if r.status != ReportStatus::Pending {
                return Err(EngineError::Validation("report is not pending"));
            }
        }
        self.persist_directory(None, &Event::ReportStarted { id: report_id })
            .await
    }

    pub async fn resolve_report(
        &self,
        actor: &Actor,
        report_id: Ulid,
        action_taken: String,
        now: Ms,
    ) -> Result<(), EngineError> {
        if !actor.is_operator() {
            return Err(EngineError::Unauthorized {
                role: actor.role,
                action: "resolve reports",
            });
        }
        if action_taken.len() > MAX_TEXT_LEN {
            return Err(EngineError::Validation("action description too long"));
        }
        {
            let r = self.reports.get(&report_id).ok_or(EngineError::NotFound(report_id))?;
            if !r.is_active() {
                return Err(EngineError::Validation("report is no longer active"));
            }
        }
        self.persist_directory(
            None,
            &Event::ReportResolved {
                id: report_id,
                action_taken,
                at: now,
            },
        )
        .await
    }

    pub async fn archive_report(&self, actor: &Actor, report_id: Ulid) -> Result<(), EngineError> {
        if !actor.is_admin() {
            return Err(EngineError::Unauthorized {
                role: actor.role,
                action: "archive reports",
            });
        }
        {
            let r = self.reports.get(&report_id).ok_or(EngineError::NotFound(report_id))?;
            if r.status != ReportStatus::Resolved {
                return Err(EngineError::Validation("only resolved reports can be archived"));
            }
        }
        self.persist_directory(None, &Event::ReportArchived { id: report_id })
            .await
    }

    /// Active-report counts per staff member, optionally narrowed to one
    /// floor. Sorted by staff id so the output is stable.
    pub fn workloads(&self, floor: Option<&str>) -> Vec<WorkloadInfo> {
        let mut active: HashMap<Ulid, usize> = HashMap::new();
        for entry in self.reports.iter() {
            let r = entry.value();
            if r.is_active()
                && let Some(staff_id) = r.assigned_to {
                    *active.entry(staff_id).or_insert(0) += 1;
                }
        }
        let mut out: Vec<WorkloadInfo> = self
            .staff
            .iter()
            .filter(|e| floor.is_none_or(|f| e.value().floor == f))
            .map(|e| WorkloadInfo {
                staff: *e.key(),
                name: e.value().name.clone(),
                active_reports: active.get(e.key()).copied().unwrap_or(0),
            })
            .collect();
        out.sort_by_key(|w| w.staff);
        out
    }
}
