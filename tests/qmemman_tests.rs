// Copyright (C) 2023-2025 Qubesd Core Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

mod test_helpers;

use std::collections::HashMap;
use std::rc::Rc;

use qubesd::hypervisor::{DomainState, Hypervisor, OfflineHypervisor};
use qubesd::qdb::InMemoryBus;
use qubesd::qmemman::{
    self, Balancer, DomainRecord, balance, balloon, is_suspicious, parse_meminfo, prefmem,
};

use crate::test_helpers::run_local;

const MIB: u64 = 1024 * 1024;

fn record(mem_used: u64, memory_actual: u64) -> DomainRecord {
    DomainRecord {
        mem_used: Some(mem_used),
        memory_actual,
        no_progress: false,
    }
}

/// `mem_used` value whose preferred allotment is exactly `pref` (non-dom0).
fn used_for_pref(pref: u64) -> u64 {
    (pref as f64 / qmemman::CACHE_FACTOR) as u64
}

#[test]
fn meminfo_parsing_scales_to_bytes() {
    let info = parse_meminfo(
        "MemTotal:  1048576 kB\n\
         MemFree:    524288 kB\n\
         Buffers:     10240 kB\n\
         Cached:      20480 kB\n\
         SwapTotal:  262144 kB\n\
         SwapFree:   262144 kB\n",
    )
    .unwrap();
    assert_eq!(info.mem_total, 1048576 * 1024);
    assert_eq!(info.mem_free, 524288 * 1024);
    assert!(!is_suspicious(&info));
}

#[test]
fn malformed_meminfo_is_rejected() {
    assert!(parse_meminfo("").is_none());
    assert!(parse_meminfo("MemTotal: lots\n").is_none());
    // missing SwapFree
    assert!(
        parse_meminfo("MemTotal: 1\nMemFree: 1\nBuffers: 1\nCached: 1\nSwapTotal: 1\n").is_none()
    );
    // swap accounting inside out
    assert!(
        parse_meminfo(
            "MemTotal: 100\nMemFree: 10\nBuffers: 1\nCached: 1\nSwapTotal: 1\nSwapFree: 2\n"
        )
        .is_none()
    );
}

#[test]
fn inflated_totals_are_suspicious() {
    let info = parse_meminfo(
        "MemTotal: 100\nMemFree: 90\nBuffers: 10\nCached: 10\nSwapTotal: 0\nSwapFree: 0\n",
    )
    .unwrap();
    assert!(is_suspicious(&info));
}

#[test]
fn preferred_size_formula_is_exact() {
    let rec = record(1000 * MIB, 0);
    assert_eq!(prefmem("work", &rec), 1000.0 * MIB as f64 * 1.3);
    assert_eq!(
        prefmem("dom0", &rec),
        1000.0 * MIB as f64 * 1.3 + 350.0 * MIB as f64
    );
}

#[test]
fn balloon_shrinks_only_the_donor() {
    // host free = 50 MiB; A holds 1 GiB but prefers 400 MiB; B holds
    // 400 MiB and prefers 1 GiB. A request for 200 MiB must squeeze A by at
    // least 150 MiB plus the safety margin and leave B untouched.
    let mut domains = HashMap::new();
    domains.insert("a".to_owned(), record(used_for_pref(400 * MIB), 1024 * MIB));
    domains.insert("b".to_owned(), record(used_for_pref(1024 * MIB), 400 * MIB));

    let requests = balloon(200 * MIB - 50 * MIB, &domains);
    assert_eq!(requests.len(), 1);
    let (donor, target) = &requests[0];
    assert_eq!(donor, "a");
    let squeezed = 1024 * MIB - target;
    let wanted = (150.0 * MIB as f64 * qmemman::REQ_SAFETY_NET_FACTOR) as u64;
    assert!(
        squeezed >= wanted && squeezed < wanted + 2 * MIB,
        "squeezed {squeezed}, wanted at least {wanted}"
    );
}

#[test]
fn balloon_reports_failure_when_donors_cannot_cover() {
    let mut domains = HashMap::new();
    domains.insert("a".to_owned(), record(used_for_pref(400 * MIB), 500 * MIB));
    // only 100 MiB of surplus available, 200 MiB wanted
    let requests = balloon(200 * MIB, &domains);
    assert!(requests.is_empty(), "caller must fail, not retry forever");
}

#[test]
fn balloon_skips_unknown_and_stuck_domains() {
    let mut domains = HashMap::new();
    domains.insert("a".to_owned(), record(used_for_pref(100 * MIB), 1024 * MIB));
    domains.get_mut("a").unwrap().no_progress = true;
    domains.insert(
        "b".to_owned(),
        DomainRecord {
            mem_used: None,
            memory_actual: 1024 * MIB,
            no_progress: false,
        },
    );
    assert!(balloon(10 * MIB, &domains).is_empty());
}

#[test]
fn balance_with_surplus_distributes_proportionally() {
    let mut domains = HashMap::new();
    domains.insert("a".to_owned(), record(used_for_pref(400 * MIB), 400 * MIB));
    domains.insert("b".to_owned(), record(used_for_pref(400 * MIB), 400 * MIB));

    let xenfree = 800 * MIB;
    let requests = balance(xenfree, &domains);
    assert_eq!(requests.len(), 2);
    for (_, target) in &requests {
        // each preference is ~400 MiB and the surplus splits evenly; the
        // 0.999 truncation keeps targets a whisker below the exact share
        assert!(*target > 700 * MIB && *target <= 800 * MIB, "target {target}");
    }
}

#[test]
fn balance_when_low_squeezes_donors_to_preference() {
    let mut domains = HashMap::new();
    domains.insert("a".to_owned(), record(used_for_pref(400 * MIB), 1024 * MIB));
    domains.insert("b".to_owned(), record(used_for_pref(1024 * MIB), 400 * MIB));

    let requests = balance(50 * MIB, &domains);
    let a_target = requests.iter().find(|(n, _)| n == "a").map(|(_, t)| *t).unwrap();
    let b_target = requests.iter().find(|(n, _)| n == "b").map(|(_, t)| *t).unwrap();

    // the donor lands exactly at its preference
    assert!((a_target as f64 - 400.0 * MIB as f64).abs() < MIB as f64);
    // the acceptor grows by what was squeezed out plus the free memory
    assert!(b_target > 400 * MIB);
}

fn balancer_with_two_domains(
    free: u64,
    a_actual: u64,
    b_actual: u64,
) -> (Rc<Balancer>, Rc<OfflineHypervisor>) {
    let hv = Rc::new(OfflineHypervisor::new(4, 16 * 1024 * MIB));
    hv.force_state("a", DomainState::Running);
    hv.force_state("b", DomainState::Running);
    hv.set_memory_actual("a", a_actual);
    hv.set_memory_actual("b", b_actual);
    hv.set_free_memory(free);
    let bus = Rc::new(InMemoryBus::new());
    let balancer = Balancer::new(hv.clone(), bus);
    (balancer, hv)
}

fn meminfo_for_used(used_kib: u64, total_kib: u64) -> String {
    format!(
        "MemTotal: {total_kib} kB\nMemFree: {} kB\nBuffers: 0 kB\nCached: 0 kB\n\
         SwapTotal: 0 kB\nSwapFree: 0 kB\n",
        total_kib - used_kib
    )
}

#[test]
fn allocation_succeeds_by_shrinking_a_donor() {
    run_local(async {
        let (balancer, hv) = balancer_with_two_domains(50 * MIB, 1024 * MIB, 400 * MIB);
        // A uses ~308 MiB, so it prefers ~400 MiB and can donate the rest
        balancer.refresh_meminfo("a", &meminfo_for_used(used_for_pref(400 * MIB) / 1024, 1024 * 1024));
        balancer.refresh_meminfo("b", &meminfo_for_used(used_for_pref(1024 * MIB) / 1024, 1024 * 1024));

        let allocation = balancer.allocate(200 * MIB).await.expect("allocation must succeed");
        assert!(
            hv.calls.borrow().iter().any(|call| call.starts_with("set_memory a")),
            "the donor was not squeezed: {:?}",
            hv.calls.borrow()
        );
        assert!(
            !hv.calls.borrow().iter().any(|call| call.starts_with("set_memory b")),
            "the starving qube must be left alone"
        );
        drop(allocation);
    });
}

#[test]
fn allocation_fails_without_donors() {
    run_local(async {
        let (balancer, _hv) = balancer_with_two_domains(10 * MIB, 400 * MIB, 400 * MIB);
        balancer.refresh_meminfo("a", &meminfo_for_used(used_for_pref(1024 * MIB) / 1024, 1024 * 1024));
        balancer.refresh_meminfo("b", &meminfo_for_used(used_for_pref(1024 * MIB) / 1024, 1024 * 1024));
        assert!(balancer.allocate(500 * MIB).await.is_err());
    });
}

#[test]
fn allocation_returns_immediately_when_memory_is_free() {
    run_local(async {
        let (balancer, hv) = balancer_with_two_domains(4096 * MIB, 1024 * MIB, 400 * MIB);
        let _allocation = balancer.allocate(200 * MIB).await.unwrap();
        assert!(hv.calls.borrow().iter().all(|call| !call.starts_with("set_memory")));
    });
}

#[test]
fn idle_balance_conserves_total_memory() {
    run_local(async {
        let (balancer, hv) = balancer_with_two_domains(800 * MIB, 1500 * MIB, 400 * MIB);
        balancer.refresh_meminfo("a", &meminfo_for_used(used_for_pref(400 * MIB) / 1024, 2048 * 1024));
        balancer.refresh_meminfo("b", &meminfo_for_used(used_for_pref(1024 * MIB) / 1024, 1024 * 1024));

        let total_before = 800 * MIB + 1500 * MIB + 400 * MIB;
        balancer.balance_once().await.unwrap();

        let domains = run_domain_snapshot(&hv).await;
        let total_after: u64 = hv.free_memory().await.unwrap()
            + domains.iter().map(|(_, actual)| actual).sum::<u64>();
        let drift = total_before.abs_diff(total_after);
        assert!(
            drift < 16 * MIB,
            "memory must be conserved within scheduling precision, drifted {drift}"
        );
    });
}

async fn run_domain_snapshot(hv: &OfflineHypervisor) -> Vec<(String, u64)> {
    hv.domain_list()
        .await
        .unwrap()
        .into_iter()
        .map(|info| (info.name, info.memory_actual))
        .collect()
}

#[test]
fn idle_balance_skips_small_adjustments() {
    run_local(async {
        // both qubes sit 50 MiB over their preference with next to nothing
        // free, so every computed change stays under the churn threshold
        let (balancer, hv) = balancer_with_two_domains(10 * MIB, 450 * MIB, 450 * MIB);
        balancer.refresh_meminfo("a", &meminfo_for_used(used_for_pref(400 * MIB) / 1024, 1024 * 1024));
        balancer.refresh_meminfo("b", &meminfo_for_used(used_for_pref(400 * MIB) / 1024, 1024 * 1024));

        balancer.balance_once().await.unwrap();
        assert!(
            hv.calls.borrow().iter().all(|call| !call.starts_with("set_memory")),
            "adjustments under 100 MiB must not be issued: {:?}",
            hv.calls.borrow()
        );
    });
}

#[test]
fn suspicious_meminfo_marks_the_record_unknown() {
    let hv = Rc::new(OfflineHypervisor::new(4, 16 * 1024 * MIB));
    let bus = Rc::new(InMemoryBus::new());
    let balancer = Balancer::new(hv, bus);

    balancer.refresh_meminfo("a", &meminfo_for_used(100 * 1024, 1024 * 1024));
    assert!(balancer.record("a").unwrap().mem_used.is_some());

    balancer.refresh_meminfo(
        "a",
        "MemTotal: 100\nMemFree: 90\nBuffers: 10\nCached: 10\nSwapTotal: 0\nSwapFree: 0\n",
    );
    assert!(balancer.record("a").unwrap().mem_used.is_none());
}
